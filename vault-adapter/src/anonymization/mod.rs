//! PII detection and anonymization for data leaving the primary tier.
//!
//! `PiiAnonymizer` is built once from `AnonymizationConfig`. After construction it only
//! reads its compiled patterns; the token table (Tokenize strategy) is the single piece
//! of interior state and is internally synchronized.

pub mod patterns;
pub mod strategy;

use crate::config::{AnonymizationConfig, AnonymizationStrategy, EncryptionConfig};
use crate::stats::AdapterStats;
use serde_json::{Map, Value};
use std::sync::Arc;
use strategy::{EnvelopeCipher, TokenTable};

pub use crate::config::PiiType;
pub use patterns::{PiiDetection, PiiDetector, PiiKind};

/// Replacement for any value nested deeper than `max_depth`.
pub const DEPTH_LIMIT_PLACEHOLDER: &str = "[DEPTH_LIMIT_EXCEEDED]";

pub struct PiiAnonymizer {
    enabled: bool,
    detector: PiiDetector,
    preserve_format: bool,
    max_depth: usize,
    cipher: Option<EnvelopeCipher>,
    tokens: TokenTable,
    stats: Option<Arc<AdapterStats>>,
}

impl std::fmt::Debug for PiiAnonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiiAnonymizer")
            .field("enabled", &self.enabled)
            .field("detector", &self.detector)
            .field("preserve_format", &self.preserve_format)
            .field("max_depth", &self.max_depth)
            .field("encrypt_key", &self.cipher.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PiiAnonymizer {
    pub fn new(config: &AnonymizationConfig, encryption: &EncryptionConfig) -> Result<Self, String> {
        let detector = PiiDetector::new(config)?;
        let cipher = encryption
            .anonymization_key_bytes()?
            .map(|key| EnvelopeCipher::new(&key));
        Ok(Self {
            enabled: config.enabled,
            detector,
            preserve_format: config.preserve_format,
            max_depth: config.max_depth,
            cipher,
            tokens: TokenTable::default(),
            stats: None,
        })
    }

    /// Report rewritten matches into a shared statistics handle.
    pub fn with_stats(mut self, stats: Arc<AdapterStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn detect(&self, text: &str) -> Vec<PiiDetection> {
        if !self.enabled {
            return Vec::new();
        }
        self.detector.detect(text)
    }

    pub fn contains_pii(&self, text: &str) -> bool {
        self.enabled && self.detector.contains_pii(text)
    }

    /// Anonymize a string, returning the rewritten text and how many spans were replaced.
    pub fn anonymize_text(&self, text: &str) -> (String, u64) {
        if !self.enabled {
            return (text.to_string(), 0);
        }
        let matches = self.detector.resolved_matches(text);
        if matches.is_empty() {
            return (text.to_string(), 0);
        }
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end, index) in &matches {
            out.push_str(&text[cursor..*start]);
            let pattern = self.detector.pattern(*index);
            out.push_str(&self.rewrite(pattern.strategy, &pattern.kind, &text[*start..*end]));
            cursor = *end;
        }
        out.push_str(&text[cursor..]);
        (out, matches.len() as u64)
    }

    /// Recursively anonymize every string (and object key) in `value`. Non-string leaves
    /// pass through; anything deeper than `max_depth` is replaced by a placeholder.
    pub fn anonymize_value(&self, value: &Value) -> Value {
        let (out, count) = self.anonymize_value_counted(value);
        if let Some(stats) = &self.stats {
            stats.record_pii_anonymized(count);
        }
        out
    }

    /// Same as `anonymize_value` but returns the rewrite count instead of recording it.
    pub fn anonymize_value_counted(&self, value: &Value) -> (Value, u64) {
        if !self.enabled {
            return (value.clone(), 0);
        }
        let mut count = 0;
        let out = self.walk(value, 0, &mut count);
        (out, count)
    }

    fn walk(&self, value: &Value, depth: usize, count: &mut u64) -> Value {
        if depth > self.max_depth {
            return Value::String(DEPTH_LIMIT_PLACEHOLDER.to_string());
        }
        match value {
            Value::String(s) => {
                let (text, n) = self.anonymize_text(s);
                *count += n;
                Value::String(text)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.walk(item, depth + 1, count))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let (base, n) = self.anonymize_text(key);
                    *count += n;
                    // A rewritten key may land on a placeholder or on a key already emitted.
                    let mut new_key = base.clone();
                    let mut suffix = 2;
                    while out.contains_key(&new_key) {
                        new_key = format!("{}_{}", base, suffix);
                        suffix += 1;
                    }
                    out.insert(new_key, self.walk(item, depth + 1, count));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn rewrite(&self, chosen: AnonymizationStrategy, kind: &PiiKind, matched: &str) -> String {
        let tag = kind.tag();
        match chosen {
            AnonymizationStrategy::Redact => strategy::redact(&tag),
            AnonymizationStrategy::Hash => strategy::hash(&tag, matched),
            AnonymizationStrategy::Randomize => {
                if self.preserve_format {
                    strategy::randomize_preserving(matched)
                } else {
                    strategy::randomize_opaque()
                }
            }
            AnonymizationStrategy::Encrypt => match &self.cipher {
                Some(cipher) => cipher.seal(matched).unwrap_or_else(|e| {
                    tracing::warn!("[Anonymizer] {} envelope failed, redacting: {}", tag, e);
                    strategy::redact(&tag)
                }),
                // Config validation requires a key for this strategy; redact rather than leak.
                None => strategy::redact(&tag),
            },
            AnonymizationStrategy::Tokenize => self.tokens.token_for(matched),
        }
    }

    /// Reverse an `Encrypt`-strategy envelope with the configured key.
    pub fn decrypt_envelope(&self, envelope: &str) -> Option<String> {
        self.cipher.as_ref()?.open(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomPattern, SecretValue};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn anonymizer(strategy: AnonymizationStrategy, types: &[PiiType]) -> PiiAnonymizer {
        let config = AnonymizationConfig {
            strategy,
            pii_types: types.iter().copied().collect(),
            ..AnonymizationConfig::default()
        };
        let encryption = EncryptionConfig {
            anonymization_key: Some(SecretValue::new("11".repeat(32))),
            ..EncryptionConfig::default()
        };
        PiiAnonymizer::new(&config, &encryption).unwrap()
    }

    #[test]
    fn test_redact_email() {
        let anon = anonymizer(AnonymizationStrategy::Redact, &[PiiType::Email]);
        let (text, n) = anon.anonymize_text("contact alice@example.com");
        assert_eq!(text, "contact [EMAIL_REDACTED]");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_anonymize_value_recurses_and_passes_other_leaves() {
        let anon = anonymizer(AnonymizationStrategy::Redact, &PiiType::ALL);
        let input = json!({
            "turns": [
                {"role": "user", "text": "I am at 10.0.0.7", "tokens": 12},
                {"role": "assistant", "text": "noted", "ok": true, "score": null}
            ]
        });
        let (out, n) = anon.anonymize_value_counted(&input);
        assert_eq!(
            out,
            json!({
                "turns": [
                    {"role": "user", "text": "I am at [IP_ADDRESS_REDACTED]", "tokens": 12},
                    {"role": "assistant", "text": "noted", "ok": true, "score": null}
                ]
            })
        );
        assert_eq!(n, 1);
    }

    #[test]
    fn test_hash_strategy_is_idempotent() {
        let anon = anonymizer(AnonymizationStrategy::Hash, &PiiType::ALL);
        let input = json!({
            "a": "mail alice@example.com or call 555-123-4567",
            "b": ["ssn 123-45-6789", "token: sk-abcdefghijklmnopqrstu"],
            "c": "Dr. Ada Lovelace lives at 12 Crescent Road, dob 1815-12-10"
        });
        let once = anon.anonymize_value(&input);
        let twice = anon.anonymize_value(&once);
        assert_eq!(once, twice);
        assert_ne!(once, input);
        assert!(!anon.contains_pii(&once.to_string()));
    }

    #[test]
    fn test_hash_is_deterministic_across_instances() {
        let a = anonymizer(AnonymizationStrategy::Hash, &PiiType::ALL);
        let b = anonymizer(AnonymizationStrategy::Hash, &PiiType::ALL);
        let input = json!({"msg": "reach me at bob@corp.io"});
        assert_eq!(a.anonymize_value(&input), b.anonymize_value(&input.clone()));
    }

    #[test]
    fn test_overlapping_detections_rewrite_each_span_once() {
        let config = AnonymizationConfig {
            strategy: AnonymizationStrategy::Redact,
            pii_types: [PiiType::SocialSecurityNumber, PiiType::CreditCard]
                .into_iter()
                .collect(),
            custom_patterns: vec![CustomPattern {
                name: "bridge".to_string(),
                regex: r"\d{4} card \d{4}".to_string(),
                strategy: AnonymizationStrategy::Redact,
            }],
            ..AnonymizationConfig::default()
        };
        let anon = PiiAnonymizer::new(&config, &EncryptionConfig::default()).unwrap();
        let (text, n) = anon.anonymize_text("SSN 123-45-6789 card 1234-5678-9012-3456");
        assert_eq!(text, "SSN [SSN_REDACTED] card [CREDIT_CARD_REDACTED]");
        assert_eq!(n, 2);
        for fragment in ["123", "6789", "1234", "3456"] {
            assert!(!text.contains(fragment));
        }
    }

    #[test]
    fn test_disabled_is_identity_and_uncounted() {
        let stats = AdapterStats::new();
        let config = AnonymizationConfig {
            enabled: false,
            ..AnonymizationConfig::default()
        };
        let anon = PiiAnonymizer::new(&config, &EncryptionConfig::default())
            .unwrap()
            .with_stats(stats.clone());
        let input = json!({"email": "alice@example.com", "n": [1, 2, {"ip": "10.1.1.1"}]});
        assert_eq!(anon.anonymize_value(&input), input);
        assert!(anon.detect("alice@example.com").is_empty());
        assert_eq!(stats.snapshot().pii_instances_anonymized, 0);
    }

    #[test]
    fn test_stats_count_rewritten_matches() {
        let stats = AdapterStats::new();
        let anon = anonymizer(AnonymizationStrategy::Redact, &[PiiType::Email]).with_stats(stats.clone());
        anon.anonymize_value(&json!(["a@b.co", "c@d.co", "none", {"x": "e@f.co"}]));
        assert_eq!(stats.snapshot().pii_instances_anonymized, 3);
    }

    #[test]
    fn test_depth_limit_caps_recursion() {
        let config = AnonymizationConfig {
            max_depth: 2,
            strategy: AnonymizationStrategy::Redact,
            ..AnonymizationConfig::default()
        };
        let anon = PiiAnonymizer::new(&config, &EncryptionConfig::default()).unwrap();
        let input = json!({"l1": {"l2": {"l3": "alice@example.com"}}});
        let out = anon.anonymize_value(&input);
        assert_eq!(out, json!({"l1": {"l2": {"l3": DEPTH_LIMIT_PLACEHOLDER}}}));
        assert_eq!(anon.anonymize_value(&out), out);
    }

    #[test]
    fn test_object_keys_are_anonymized_without_collisions() {
        let anon = anonymizer(AnonymizationStrategy::Redact, &[PiiType::Email]);
        let out = anon.anonymize_value(&json!({"a@x.io": 1, "b@x.io": 2}));
        let obj = out.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("[EMAIL_REDACTED]"));
        assert!(obj.contains_key("[EMAIL_REDACTED]_2"));
    }

    #[test]
    fn test_rewritten_key_never_overwrites_an_existing_key() {
        let anon = anonymizer(AnonymizationStrategy::Redact, &[PiiType::Email]);
        let out = anon.anonymize_value(&json!({
            "A@x.io": 1,
            "B@x.io": 2,
            "[EMAIL_REDACTED]_2": 3
        }));
        let obj = out.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        let mut values: Vec<i64> = obj.values().filter_map(Value::as_i64).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_encrypt_strategy_is_reversible() {
        let anon = anonymizer(AnonymizationStrategy::Encrypt, &[PiiType::Email]);
        let (text, n) = anon.anonymize_text("mail alice@example.com");
        assert_eq!(n, 1);
        let envelope = text.strip_prefix("mail ").unwrap();
        assert!(envelope.starts_with(strategy::ENVELOPE_PREFIX));
        assert_eq!(
            anon.decrypt_envelope(envelope).as_deref(),
            Some("alice@example.com")
        );
    }

    #[test]
    fn test_tokenize_is_stable_within_instance() {
        let anon = anonymizer(AnonymizationStrategy::Tokenize, &[PiiType::Email]);
        let (a, _) = anon.anonymize_text("alice@example.com");
        let (b, _) = anon.anonymize_text("alice@example.com");
        assert_eq!(a, b);
        assert!(a.starts_with("TOK_"));
    }

    #[test]
    fn test_randomize_without_format_is_opaque() {
        let config = AnonymizationConfig {
            strategy: AnonymizationStrategy::Randomize,
            preserve_format: false,
            pii_types: [PiiType::SocialSecurityNumber].into_iter().collect(),
            ..AnonymizationConfig::default()
        };
        let anon = PiiAnonymizer::new(&config, &EncryptionConfig::default()).unwrap();
        let (text, _) = anon.anonymize_text("123-45-6789");
        assert!(text.starts_with("RND_"));
        assert!(!text.contains('-'));
    }
}
