use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration for the dual-tier adapter. Constructed once at startup and
/// validated before the adapter performs any I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Master switch for everything beyond the primary tier
    pub enabled: bool,
    /// Base URL of the remote vault service
    pub remote_endpoint: String,
    /// Credential sent with every vault request
    pub api_key: SecretValue,
    pub storage_mode: StorageMode,
    pub archival_policy: ArchivalPolicy,
    pub anonymization: AnonymizationConfig,
    pub performance: PerformanceConfig,
    pub encryption: EncryptionConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_endpoint: "http://localhost:8080".to_string(),
            api_key: SecretValue::default(),
            storage_mode: StorageMode::ArchiveOnPolicy,
            archival_policy: ArchivalPolicy::default(),
            anonymization: AnonymizationConfig::default(),
            performance: PerformanceConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// How writes are split between the primary tier and the vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Vault disabled
    PrimaryOnly,
    /// Write must reach both tiers
    DualSync,
    /// Primary is authoritative, vault write is best-effort and decoupled
    DualAsync,
    /// Whole sessions are archived when the archival policy says so
    ArchiveOnPolicy,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary_only" | "primary-only" => Ok(StorageMode::PrimaryOnly),
            "dual_sync" | "dual-sync" => Ok(StorageMode::DualSync),
            "dual_async" | "dual-async" => Ok(StorageMode::DualAsync),
            "archive_on_policy" | "archive-on-policy" => Ok(StorageMode::ArchiveOnPolicy),
            other => Err(format!(
                "Invalid storage mode '{}'. Use: primary_only, dual_sync, dual_async, archive_on_policy",
                other
            )),
        }
    }
}

/// When a session becomes a candidate for archival
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivalTrigger {
    Immediate,
    OnSessionEnd,
    Scheduled,
    /// Days since the session's last write
    AgeThreshold(u32),
    Manual,
}

impl FromStr for ArchivalTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(days) = s
            .strip_prefix("age_threshold:")
            .or_else(|| s.strip_prefix("age-threshold:"))
        {
            return days
                .trim()
                .parse()
                .map(ArchivalTrigger::AgeThreshold)
                .map_err(|_| format!("Invalid age threshold '{}'", days));
        }
        match s.as_str() {
            "immediate" => Ok(ArchivalTrigger::Immediate),
            "on_session_end" | "on-session-end" => Ok(ArchivalTrigger::OnSessionEnd),
            "scheduled" => Ok(ArchivalTrigger::Scheduled),
            "manual" => Ok(ArchivalTrigger::Manual),
            other => Err(format!(
                "Invalid archival trigger '{}'. Use: immediate, on_session_end, scheduled, age_threshold:<days>, manual",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalPolicy {
    pub trigger: ArchivalTrigger,
    /// Retention requested from the vault for archived data
    pub retention_days: u32,
    /// Remove session data from the primary tier once it is safely archived
    pub auto_delete_from_primary: bool,
    /// Days since last access before an archived session may be evicted
    pub primary_retention_days: Option<u32>,
    /// Maximum sessions archived per scheduled tick
    pub batch_size: u32,
    pub tags: BTreeSet<String>,
    /// Period of the scheduled/age-threshold evaluation
    pub schedule_interval_seconds: u64,
}

impl Default for ArchivalPolicy {
    fn default() -> Self {
        Self {
            trigger: ArchivalTrigger::OnSessionEnd,
            retention_days: 365,
            auto_delete_from_primary: false,
            primary_retention_days: None,
            batch_size: 100,
            tags: BTreeSet::new(),
            schedule_interval_seconds: 3600,
        }
    }
}

/// Built-in PII categories, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    PhoneNumber,
    CreditCard,
    SocialSecurityNumber,
    IpAddress,
    PhysicalAddress,
    PersonName,
    DateOfBirth,
    ApiKeyOrToken,
}

impl PiiType {
    pub const ALL: [PiiType; 9] = [
        PiiType::Email,
        PiiType::PhoneNumber,
        PiiType::CreditCard,
        PiiType::SocialSecurityNumber,
        PiiType::IpAddress,
        PiiType::PhysicalAddress,
        PiiType::PersonName,
        PiiType::DateOfBirth,
        PiiType::ApiKeyOrToken,
    ];

    /// Upper-case tag used inside placeholders and pseudonyms.
    pub fn tag(&self) -> &'static str {
        match self {
            PiiType::Email => "EMAIL",
            PiiType::PhoneNumber => "PHONE",
            PiiType::CreditCard => "CREDIT_CARD",
            PiiType::SocialSecurityNumber => "SSN",
            PiiType::IpAddress => "IP_ADDRESS",
            PiiType::PhysicalAddress => "ADDRESS",
            PiiType::PersonName => "PERSON",
            PiiType::DateOfBirth => "DOB",
            PiiType::ApiKeyOrToken => "SECRET",
        }
    }
}

impl fmt::Display for PiiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for PiiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(PiiType::Email),
            "phone" | "phone_number" => Ok(PiiType::PhoneNumber),
            "credit_card" => Ok(PiiType::CreditCard),
            "ssn" | "social_security_number" => Ok(PiiType::SocialSecurityNumber),
            "ip" | "ip_address" => Ok(PiiType::IpAddress),
            "address" | "physical_address" => Ok(PiiType::PhysicalAddress),
            "name" | "person_name" => Ok(PiiType::PersonName),
            "dob" | "date_of_birth" => Ok(PiiType::DateOfBirth),
            "api_key" | "token" | "api_key_or_token" => Ok(PiiType::ApiKeyOrToken),
            other => Err(format!("Unknown PII type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationStrategy {
    Redact,
    Hash,
    Randomize,
    Encrypt,
    Tokenize,
}

impl FromStr for AnonymizationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redact" => Ok(AnonymizationStrategy::Redact),
            "hash" => Ok(AnonymizationStrategy::Hash),
            "randomize" => Ok(AnonymizationStrategy::Randomize),
            "encrypt" => Ok(AnonymizationStrategy::Encrypt),
            "tokenize" => Ok(AnonymizationStrategy::Tokenize),
            other => Err(format!(
                "Invalid anonymization strategy '{}'. Use: redact, hash, randomize, encrypt, tokenize",
                other
            )),
        }
    }
}

/// Operator-defined pattern, applied after the built-in ones in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub regex: String,
    pub strategy: AnonymizationStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizationConfig {
    pub enabled: bool,
    pub pii_types: BTreeSet<PiiType>,
    pub strategy: AnonymizationStrategy,
    pub preserve_format: bool,
    pub custom_patterns: Vec<CustomPattern>,
    /// Nesting depth beyond which subtrees are replaced instead of scanned
    pub max_depth: usize,
}

impl Default for AnonymizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pii_types: PiiType::ALL.into_iter().collect(),
            strategy: AnonymizationStrategy::Hash,
            preserve_format: true,
            custom_patterns: Vec::new(),
            max_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Upper bound for a single vault request
    pub timeout_seconds: u64,
    /// Let the background driver retry queued operations
    pub retry_enabled: bool,
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_backoff_ms: u64,
    /// Ceiling for the exponential backoff delay
    pub max_backoff_ms: u64,
    /// Keep the primary tier serving when the vault is failing
    pub graceful_degradation: bool,
    pub queue_failed_writes: bool,
    pub max_queue_size: u32,
    /// Concurrent vault requests across the whole adapter
    pub max_concurrent_ops: u32,
    /// Period of the background retry drain
    pub drain_interval_ms: u64,
    /// Where pending queue entries are written on shutdown
    pub spill_path: Option<PathBuf>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_enabled: true,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_backoff_ms: 300_000,
            graceful_degradation: true,
            queue_failed_writes: true,
            max_queue_size: 10_000,
            max_concurrent_ops: 10,
            drain_interval_ms: 5000,
            spill_path: None,
        }
    }
}

/// Encryption policy surface. `enabled`/`key_id` are forwarded to the vault with each
/// entry; `anonymization_key` keys the `Encrypt` anonymization strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key_id: Option<String>,
    /// 32-byte key, hex encoded
    pub anonymization_key: Option<SecretValue>,
}

impl EncryptionConfig {
    /// Decode the anonymization key, if configured and well formed.
    pub fn anonymization_key_bytes(&self) -> Result<Option<[u8; 32]>, String> {
        let Some(secret) = &self.anonymization_key else {
            return Ok(None);
        };
        let raw = hex::decode(secret.expose().trim())
            .map_err(|e| format!("encryption.anonymization_key is not valid hex: {}", e))?;
        let key: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| {
            format!(
                "encryption.anonymization_key must be 32 bytes, got {}",
                v.len()
            )
        })?;
        Ok(Some(key))
    }
}

/// Secret string that never shows up in `Debug` output or serialized config.
pub struct SecretValue(SecretString);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl Default for SecretValue {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl Clone for SecretValue {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("SecretValue(<empty>)")
        } else {
            f.write_str("SecretValue(<redacted>)")
        }
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SecretValue::new(raw))
    }
}

impl StorageConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse storage config: {}", e))
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with `VAULT_ADAPTER_*` environment variables.
    pub fn from_env() -> Result<Self, Vec<String>> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), Vec<String>> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Overlay settings from any name → value lookup. Every malformed value is reported.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), Vec<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        fn parsed<T: FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
            errors: &mut Vec<String>,
        ) -> Option<T>
        where
            T::Err: fmt::Display,
        {
            let raw = lookup(name)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(format!("{}: {}", name, e));
                    None
                }
            }
        }

        fn list<T: FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
            errors: &mut Vec<String>,
        ) -> Option<Vec<T>>
        where
            T::Err: fmt::Display,
        {
            let raw = lookup(name)?;
            let mut out = Vec::new();
            for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match item.parse::<T>() {
                    Ok(v) => out.push(v),
                    Err(e) => errors.push(format!("{}: {}", name, e)),
                }
            }
            Some(out)
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_ENABLED", &mut errors) {
            self.enabled = v;
        }
        if let Some(v) = lookup("VAULT_ADAPTER_ENDPOINT") {
            self.remote_endpoint = v;
        }
        if let Some(v) = lookup("VAULT_ADAPTER_API_KEY") {
            self.api_key = SecretValue::new(v);
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_STORAGE_MODE", &mut errors) {
            self.storage_mode = v;
        }

        let policy = &mut self.archival_policy;
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_ARCHIVAL_TRIGGER", &mut errors) {
            policy.trigger = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_RETENTION_DAYS", &mut errors) {
            policy.retention_days = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_AUTO_DELETE_PRIMARY", &mut errors) {
            policy.auto_delete_from_primary = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_PRIMARY_RETENTION_DAYS", &mut errors) {
            policy.primary_retention_days = Some(v);
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_BATCH_SIZE", &mut errors) {
            policy.batch_size = v;
        }
        if let Some(v) = list::<String>(lookup, "VAULT_ADAPTER_TAGS", &mut errors) {
            policy.tags = v.into_iter().collect();
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_SCHEDULE_INTERVAL_SECS", &mut errors) {
            policy.schedule_interval_seconds = v;
        }

        let anon = &mut self.anonymization;
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_ANONYMIZE", &mut errors) {
            anon.enabled = v;
        }
        if let Some(v) = list::<PiiType>(lookup, "VAULT_ADAPTER_PII_TYPES", &mut errors) {
            anon.pii_types = v.into_iter().collect();
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_ANONYMIZATION_STRATEGY", &mut errors) {
            anon.strategy = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_PRESERVE_FORMAT", &mut errors) {
            anon.preserve_format = v;
        }

        let perf = &mut self.performance;
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_TIMEOUT_SECS", &mut errors) {
            perf.timeout_seconds = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_RETRY_ENABLED", &mut errors) {
            perf.retry_enabled = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_MAX_RETRIES", &mut errors) {
            perf.max_retries = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_RETRY_BACKOFF_MS", &mut errors) {
            perf.retry_backoff_ms = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_GRACEFUL_DEGRADATION", &mut errors) {
            perf.graceful_degradation = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_QUEUE_FAILED_WRITES", &mut errors) {
            perf.queue_failed_writes = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_MAX_QUEUE_SIZE", &mut errors) {
            perf.max_queue_size = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_MAX_CONCURRENT_OPS", &mut errors) {
            perf.max_concurrent_ops = v;
        }
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_DRAIN_INTERVAL_MS", &mut errors) {
            perf.drain_interval_ms = v;
        }
        if let Some(v) = lookup("VAULT_ADAPTER_SPILL_PATH") {
            perf.spill_path = Some(PathBuf::from(v));
        }

        let enc = &mut self.encryption;
        if let Some(v) = parsed(lookup, "VAULT_ADAPTER_ENCRYPTION", &mut errors) {
            enc.enabled = v;
        }
        if let Some(v) = lookup("VAULT_ADAPTER_ENCRYPTION_KEY_ID") {
            enc.key_id = Some(v);
        }
        if let Some(v) = lookup("VAULT_ADAPTER_ANONYMIZATION_KEY") {
            enc.anonymization_key = Some(SecretValue::new(v));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let policy = &self.archival_policy;
        if policy.retention_days < 1 {
            errors.push("archival_policy.retention_days must be at least 1".to_string());
        }
        if policy.batch_size < 1 {
            errors.push("archival_policy.batch_size must be at least 1".to_string());
        }
        if let ArchivalTrigger::AgeThreshold(days) = policy.trigger {
            if days < 1 {
                errors.push("age_threshold trigger requires at least 1 day".to_string());
            }
        }
        if policy.auto_delete_from_primary && policy.primary_retention_days.is_none() {
            errors.push(
                "archival_policy.auto_delete_from_primary requires primary_retention_days"
                    .to_string(),
            );
        }
        if policy.schedule_interval_seconds < 1 {
            errors.push("archival_policy.schedule_interval_seconds must be at least 1".to_string());
        }

        if self.enabled {
            match url::Url::parse(&self.remote_endpoint) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(format!(
                    "remote_endpoint must use http or https, got '{}'",
                    url.scheme()
                )),
                Err(e) => errors.push(format!(
                    "remote_endpoint '{}' is not a valid URL: {}",
                    self.remote_endpoint, e
                )),
            }
            if self.api_key.is_empty() {
                errors.push("api_key is required when the vault is enabled".to_string());
            }
        }

        let perf = &self.performance;
        if perf.timeout_seconds < 1 {
            errors.push("performance.timeout_seconds must be at least 1".to_string());
        }
        if perf.max_concurrent_ops < 1 {
            errors.push("performance.max_concurrent_ops must be at least 1".to_string());
        }
        if perf.queue_failed_writes && perf.max_queue_size < 1 {
            errors.push(
                "performance.max_queue_size must be at least 1 when queue_failed_writes is set"
                    .to_string(),
            );
        }
        if perf.max_backoff_ms < perf.retry_backoff_ms {
            errors.push("performance.max_backoff_ms must not be below retry_backoff_ms".to_string());
        }

        let anon = &self.anonymization;
        let mut names = HashSet::new();
        for pattern in &anon.custom_patterns {
            if pattern.name.trim().is_empty() {
                errors.push("custom pattern names must not be empty".to_string());
            } else if !names.insert(pattern.name.as_str()) {
                errors.push(format!("duplicate custom pattern name '{}'", pattern.name));
            }
            if let Err(e) = Regex::new(&pattern.regex) {
                errors.push(format!(
                    "custom pattern '{}' has an invalid regex: {}",
                    pattern.name, e
                ));
            }
        }
        if anon.max_depth < 1 {
            errors.push("anonymization.max_depth must be at least 1".to_string());
        }

        let needs_key = anon.enabled
            && (anon.strategy == AnonymizationStrategy::Encrypt
                || anon
                    .custom_patterns
                    .iter()
                    .any(|p| p.strategy == AnonymizationStrategy::Encrypt));
        match self.encryption.anonymization_key_bytes() {
            Ok(Some(_)) => {}
            Ok(None) if needs_key => errors.push(
                "the encrypt anonymization strategy requires encryption.anonymization_key"
                    .to_string(),
            ),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// True when anything beyond the primary tier can run.
    pub fn archival_active(&self) -> bool {
        self.enabled && self.storage_mode != StorageMode::PrimaryOnly
    }
}
