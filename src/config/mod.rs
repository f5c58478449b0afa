//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → HotlineConfig (validated, immutable)
//!     → main.rs builds certificate providers and entrypoints from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; live changes go through the
//!   certificate providers and handler swaps, not through config reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CertificatesConfig, EntryPointConfig, FileCertConfig, HotlineConfig, LoggingConfig,
    TlsSetting, UrlCertConfig,
};
pub use validation::{validate_config, ValidationError};
