//! PII pattern compilation and detection.
//!
//! Patterns are compiled once when the detector is built. Detection runs every enabled
//! pattern over the original text and then resolves overlaps: the earliest-starting
//! match wins, and on a tie the pattern declared first wins.

use crate::config::{AnonymizationConfig, AnonymizationStrategy, PiiType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a detection matched: a built-in category or a named custom pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Builtin(PiiType),
    Custom(String),
}

impl PiiKind {
    /// Upper-case tag used in placeholders, e.g. `EMAIL` or `EMPLOYEE_ID`.
    pub fn tag(&self) -> String {
        match self {
            PiiKind::Builtin(t) => t.tag().to_string(),
            PiiKind::Custom(name) => name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect(),
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// A single match, with byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiDetection {
    pub pii_type: PiiKind,
    pub start_offset: usize,
    pub end_offset: usize,
    pub matched_text: String,
}

fn builtin_regex(pii_type: PiiType) -> &'static str {
    match pii_type {
        PiiType::Email => r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
        PiiType::PhoneNumber => {
            r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b"
        }
        PiiType::CreditCard => {
            r"\b(?:\d{4}[-\s]?){3}\d{4}\b|\b3[47]\d{2}[-\s]?\d{6}[-\s]?\d{5}\b"
        }
        PiiType::SocialSecurityNumber => r"\b\d{3}-\d{2}-\d{4}\b",
        PiiType::IpAddress => {
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b"
        }
        PiiType::PhysicalAddress => {
            r"\b\d{1,5}\s+(?:[A-Z][a-z]+\s+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl)\b"
        }
        PiiType::PersonName => {
            r"\b(?:Mr|Mrs|Ms|Miss|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?|\b(?i:my name is)\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?"
        }
        PiiType::DateOfBirth => {
            r"(?i)\b(?:dob|date of birth|born(?: on)?)\s*[:=]?\s*(?:\d{4}[-/.]\d{1,2}[-/.]\d{1,2}|\d{1,2}[-/.]\d{1,2}[-/.]\d{2,4})\b"
        }
        PiiType::ApiKeyOrToken => {
            r#"(?i:\b(?:api[_-]?key|secret|token|password|passwd)\s*[:=]\s*['"]?[A-Za-z0-9_\-./+=]{8,}['"]?)|\b(?:sk|pk|rk)-[A-Za-z0-9_-]{16,}|\bgh[pousr]_[A-Za-z0-9]{20,}|\bAKIA[0-9A-Z]{16}\b|\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+"#
        }
    }
}

/// A compiled pattern together with the strategy used to rewrite its matches.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPattern {
    pub kind: PiiKind,
    pub regex: Regex,
    pub strategy: AnonymizationStrategy,
}

/// Precompiled matcher set, in detection priority order.
#[derive(Debug, Clone)]
pub struct PiiDetector {
    patterns: Vec<CompiledPattern>,
}

impl PiiDetector {
    /// Compile the enabled built-in types (declaration order) followed by the custom
    /// patterns (config order). A disabled config yields an empty detector.
    pub fn new(config: &AnonymizationConfig) -> Result<Self, String> {
        let mut patterns = Vec::new();
        if !config.enabled {
            return Ok(Self { patterns });
        }
        for pii_type in PiiType::ALL {
            if !config.pii_types.contains(&pii_type) {
                continue;
            }
            let regex = Regex::new(builtin_regex(pii_type))
                .map_err(|e| format!("built-in pattern {} failed to compile: {}", pii_type, e))?;
            patterns.push(CompiledPattern {
                kind: PiiKind::Builtin(pii_type),
                regex,
                strategy: config.strategy,
            });
        }
        for custom in &config.custom_patterns {
            let regex = Regex::new(&custom.regex)
                .map_err(|e| format!("custom pattern '{}': {}", custom.name, e))?;
            patterns.push(CompiledPattern {
                kind: PiiKind::Custom(custom.name.clone()),
                regex,
                strategy: custom.strategy,
            });
        }
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub(crate) fn pattern(&self, index: usize) -> &CompiledPattern {
        &self.patterns[index]
    }

    /// Non-overlapping matches ordered by start offset, each tagged with the index of
    /// the pattern that produced it.
    pub(crate) fn resolved_matches(&self, text: &str) -> Vec<(usize, usize, usize)> {
        let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
        for (index, pattern) in self.patterns.iter().enumerate() {
            for m in pattern.regex.find_iter(text) {
                if m.start() < m.end() {
                    candidates.push((m.start(), index, m.end()));
                }
            }
        }
        candidates.sort_unstable();

        let mut accepted = Vec::with_capacity(candidates.len());
        let mut covered_until = 0usize;
        for (start, index, end) in candidates {
            if start < covered_until {
                continue;
            }
            accepted.push((start, end, index));
            covered_until = end;
        }
        accepted
    }

    pub fn detect(&self, text: &str) -> Vec<PiiDetection> {
        self.resolved_matches(text)
            .into_iter()
            .map(|(start, end, index)| PiiDetection {
                pii_type: self.patterns[index].kind.clone(),
                start_offset: start,
                end_offset: end,
                matched_text: text[start..end].to_string(),
            })
            .collect()
    }

    pub fn contains_pii(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomPattern;

    fn detector_for(types: &[PiiType]) -> PiiDetector {
        let config = AnonymizationConfig {
            pii_types: types.iter().copied().collect(),
            ..AnonymizationConfig::default()
        };
        PiiDetector::new(&config).unwrap()
    }

    fn kinds(detections: &[PiiDetection]) -> Vec<PiiKind> {
        detections.iter().map(|d| d.pii_type.clone()).collect()
    }

    #[test]
    fn test_detects_each_builtin_type() {
        let detector = detector_for(&PiiType::ALL);
        let cases = [
            ("write to alice@example.com today", PiiType::Email),
            ("call +1 555-123-4567 now", PiiType::PhoneNumber),
            ("card 4111 1111 1111 1111 on file", PiiType::CreditCard),
            ("ssn 123-45-6789", PiiType::SocialSecurityNumber),
            ("from host 192.168.10.42 yesterday", PiiType::IpAddress),
            ("ship to 221 Baker Street please", PiiType::PhysicalAddress),
            ("ask Dr. Gregory House about it", PiiType::PersonName),
            ("dob: 1990-04-12", PiiType::DateOfBirth),
            ("api_key=abcd1234efgh5678", PiiType::ApiKeyOrToken),
        ];
        for (text, expected) in cases {
            let found = detector.detect(text);
            assert_eq!(
                kinds(&found),
                vec![PiiKind::Builtin(expected)],
                "unexpected detections for {:?}",
                text
            );
        }
    }

    #[test]
    fn test_offsets_point_at_matched_text() {
        let detector = detector_for(&[PiiType::Email]);
        let text = "contact alice@example.com";
        let found = detector.detect(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_offset, 8);
        assert_eq!(found[0].end_offset, text.len());
        assert_eq!(found[0].matched_text, "alice@example.com");
    }

    #[test]
    fn test_ssn_and_card_are_not_phone_numbers() {
        let detector = detector_for(&PiiType::ALL);
        let found = detector.detect("SSN 123-45-6789 card 1234-5678-9012-3456");
        assert_eq!(
            kinds(&found),
            vec![
                PiiKind::Builtin(PiiType::SocialSecurityNumber),
                PiiKind::Builtin(PiiType::CreditCard)
            ]
        );
    }

    #[test]
    fn test_overlap_prefers_earliest_then_declared_first() {
        let config = AnonymizationConfig {
            pii_types: [PiiType::SocialSecurityNumber].into_iter().collect(),
            custom_patterns: vec![
                CustomPattern {
                    name: "same_span".to_string(),
                    regex: r"\d{3}-\d{2}-\d{4}".to_string(),
                    strategy: AnonymizationStrategy::Redact,
                },
                CustomPattern {
                    name: "earlier".to_string(),
                    regex: r"id \d{3}".to_string(),
                    strategy: AnonymizationStrategy::Redact,
                },
            ],
            ..AnonymizationConfig::default()
        };
        let detector = PiiDetector::new(&config).unwrap();

        // Same start: the built-in SSN pattern is declared before the custom one.
        let found = detector.detect("ssn 123-45-6789");
        assert_eq!(kinds(&found), vec![PiiKind::Builtin(PiiType::SocialSecurityNumber)]);

        // Earlier start wins even though it is declared last.
        let found = detector.detect("id 123-45-6789");
        assert_eq!(kinds(&found), vec![PiiKind::Custom("earlier".to_string())]);
        assert_eq!(found[0].matched_text, "id 123");
    }

    #[test]
    fn test_disabled_config_detects_nothing() {
        let config = AnonymizationConfig {
            enabled: false,
            ..AnonymizationConfig::default()
        };
        let detector = PiiDetector::new(&config).unwrap();
        assert!(detector.is_empty());
        assert!(detector.detect("alice@example.com").is_empty());
        assert!(!detector.contains_pii("alice@example.com"));
    }

    #[test]
    fn test_custom_kind_tag_is_sanitized() {
        assert_eq!(PiiKind::Custom("employee-id".to_string()).tag(), "EMPLOYEE_ID");
        assert_eq!(PiiKind::Builtin(PiiType::Email).tag(), "EMAIL");
    }
}
