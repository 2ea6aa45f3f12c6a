//! # Cadence Util
//!
//! Storage and environment plumbing shared by the engine and the CLI:
//!
//! - **`record_store`**: durable, optimistically-concurrent execution record storage
//! - **`capability_store`**: command capabilities installed at runtime
//! - **`config`**: engine configuration loading with file and environment layers
//! - **`paths`**: default locations and tilde expansion
//! - **`command_line`**: splitting of collaborator command lines
//! - **`redact`**: secret redaction for log output

pub mod capability_store;
pub mod command_line;
pub mod config;
pub mod paths;
pub mod record_store;
pub mod redact;

pub use capability_store::CapabilityStore;
pub use command_line::split_command_line;
pub use config::{ConfigError, EngineConfig, load_config, load_config_from_path};
pub use paths::{default_config_path, default_state_dir, expand_tilde};
pub use record_store::{InMemoryRecordStore, JsonRecordStore, RecordMutator, RecordStore, StoreError};
pub use redact::{redact_params, redact_sensitive};
