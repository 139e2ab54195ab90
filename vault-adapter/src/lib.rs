// vault-adapter
// Dual-tier session graph storage: fast primary store plus policy-driven, PII-safe archival
// into a remote compliance vault.

pub mod adapter;
pub mod anonymization;
pub mod config;
pub mod error;
pub mod policy;
pub mod queue;
pub mod stats;
pub mod storage_backends;
pub mod types;
pub mod vault;

pub use adapter::{
    ArchiveOutcome, BatchArchiveReport, DualStorageAdapter, FlushReport, PermanentFailure,
    ShutdownReport, TickReport,
};
pub use anonymization::{PiiAnonymizer, PiiDetection, PiiDetector, PiiKind};
pub use config::{
    AnonymizationConfig, AnonymizationStrategy, ArchivalPolicy, ArchivalTrigger, EncryptionConfig,
    PerformanceConfig, PiiType, StorageConfig, StorageMode,
};
pub use error::{AdapterError, AdapterResult, StorageError, StorageResult, VaultError, VaultResult};
pub use policy::{ArchivalEvent, ArchivalPolicyEngine, ArchivalState, SessionState};
pub use queue::{ArchivalQueue, QueuedOperation};
pub use stats::{AdapterStats, AdapterStatsSnapshot};
pub use storage_backends::{InMemoryGraphStore, StorageBackend};
pub use types::{ArchiveEntry, ArchiveKind, Direction, GraphEdge, GraphNode, StorageStats};
pub use vault::{HttpVaultClient, InMemoryVault, VaultClient};
