//! Minimal configuration loading for Bandstand.
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/bandstand/config.toml` (system)
//! 2. `~/.config/bandstand/config.toml` (user)
//! 3. `./bandstand.toml` (local override)
//! 4. Environment variables (`BANDSTAND_*`)
//!
//! # Example config
//!
//! ```toml
//! [generator]
//! base_url = "http://127.0.0.1:2000"
//! max_concurrent = 2
//! cb_threshold = 3
//! cb_cooldown_secs = 60
//!
//! [orchestration]
//! bass_signal_wait_secs = 60
//! section_child_timeout_secs = 180
//! max_section_retries = 2
//!
//! [server]
//! bind_addr = "127.0.0.1:8090"
//! ```

mod loader;

use std::path::PathBuf;

use thiserror::Error;

pub use loader::{discover_config_files, load, load_from_file};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// External generator service tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    pub base_url: String,
    /// Read timeout for one generation request, in seconds.
    pub timeout_secs: u64,
    /// Width of the concurrency semaphore gating generate calls.
    pub max_concurrent: usize,
    /// Consecutive failures before the circuit opens.
    pub cb_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    pub cb_cooldown_secs: u64,
    /// Server-side long-poll timeout per wait call, in seconds.
    pub poll_timeout_secs: u64,
    /// Maximum wait calls per job before giving up.
    pub poll_max_attempts: u32,
    /// Delays between submit retries on transient failures, in seconds.
    pub submit_retry_delays_secs: Vec<u64>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:2000".to_string(),
            timeout_secs: 120,
            max_concurrent: 2,
            cb_threshold: 3,
            cb_cooldown_secs: 60,
            poll_timeout_secs: 30,
            poll_max_attempts: 10,
            submit_retry_delays_secs: vec![2, 5, 10, 20],
        }
    }
}

/// Agent-scheduler tunables.
///
/// Both the section-retry cap and the generator submit-retry schedule
/// are exposed here so the compounded worst case (section retries x
/// submit retries) can be tuned without a code change.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationSettings {
    /// How long a bass section child waits for its drum signal.
    pub bass_signal_wait_secs: u64,
    /// Hard timeout for one section child, enforced at the dispatcher.
    pub section_child_timeout_secs: u64,
    /// Server-owned retry rounds for failed sections.
    pub max_section_retries: u32,
    /// Delays before each section retry round, in seconds.
    pub section_retry_delays_secs: Vec<u64>,
    /// Fraction of the token budget the LLM may spend on reasoning.
    pub reasoning_fraction: f64,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            bass_signal_wait_secs: 60,
            section_child_timeout_secs: 180,
            max_section_retries: 2,
            section_retry_delays_secs: vec![2, 5],
            reasoning_fraction: 0.3,
        }
    }
}

/// HTTP server bind settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Root settings object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub generator: GeneratorSettings,
    pub orchestration: OrchestrationSettings,
    pub server: ServerSettings,
    pub log_level: Option<String>,
}

impl Settings {
    /// Load settings from discovered files plus environment overlay.
    pub fn load() -> Result<Self, ConfigError> {
        loader::load()
    }
}
