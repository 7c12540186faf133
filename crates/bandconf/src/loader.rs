//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Settings};

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/bandstand/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("bandstand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    let local = PathBuf::from("bandstand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load settings from discovered files plus the `BANDSTAND_*` env overlay.
pub fn load() -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();
    for path in discover_config_files() {
        apply_file(&mut settings, &path)?;
    }
    apply_env(&mut settings);
    Ok(settings)
}

/// Load settings from a single TOML file (defaults for missing fields).
pub fn load_from_file(path: &Path) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();
    apply_file(&mut settings, path)?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Some(generator) = table.get("generator").and_then(|v| v.as_table()) {
        if let Some(v) = generator.get("base_url").and_then(|v| v.as_str()) {
            settings.generator.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = generator.get("timeout_secs").and_then(|v| v.as_integer()) {
            settings.generator.timeout_secs = v as u64;
        }
        if let Some(v) = generator.get("max_concurrent").and_then(|v| v.as_integer()) {
            settings.generator.max_concurrent = (v.max(1)) as usize;
        }
        if let Some(v) = generator.get("cb_threshold").and_then(|v| v.as_integer()) {
            settings.generator.cb_threshold = v as u32;
        }
        if let Some(v) = generator
            .get("cb_cooldown_secs")
            .and_then(|v| v.as_integer())
        {
            settings.generator.cb_cooldown_secs = v as u64;
        }
        if let Some(v) = generator
            .get("poll_timeout_secs")
            .and_then(|v| v.as_integer())
        {
            settings.generator.poll_timeout_secs = v as u64;
        }
        if let Some(v) = generator
            .get("poll_max_attempts")
            .and_then(|v| v.as_integer())
        {
            settings.generator.poll_max_attempts = v as u32;
        }
        if let Some(v) = generator.get("submit_retry_delays_secs") {
            settings.generator.submit_retry_delays_secs = parse_delay_list(v)?;
        }
    }

    if let Some(orch) = table.get("orchestration").and_then(|v| v.as_table()) {
        if let Some(v) = orch
            .get("bass_signal_wait_secs")
            .and_then(|v| v.as_integer())
        {
            settings.orchestration.bass_signal_wait_secs = v as u64;
        }
        if let Some(v) = orch
            .get("section_child_timeout_secs")
            .and_then(|v| v.as_integer())
        {
            settings.orchestration.section_child_timeout_secs = v as u64;
        }
        if let Some(v) = orch
            .get("max_section_retries")
            .and_then(|v| v.as_integer())
        {
            settings.orchestration.max_section_retries = v as u32;
        }
        if let Some(v) = orch.get("section_retry_delays_secs") {
            settings.orchestration.section_retry_delays_secs = parse_delay_list(v)?;
        }
        if let Some(v) = orch.get("reasoning_fraction").and_then(|v| v.as_float()) {
            settings.orchestration.reasoning_fraction = v.clamp(0.0, 1.0);
        }
    }

    if let Some(server) = table.get("server").and_then(|v| v.as_table()) {
        if let Some(v) = server.get("bind_addr").and_then(|v| v.as_str()) {
            settings.server.bind_addr = v.to_string();
        }
    }

    if let Some(v) = table.get("log_level").and_then(|v| v.as_str()) {
        settings.log_level = Some(v.to_string());
    }

    Ok(())
}

fn parse_delay_list(value: &toml::Value) -> Result<Vec<u64>, ConfigError> {
    let items = value.as_array().ok_or_else(|| ConfigError::InvalidValue {
        key: "retry delays".to_string(),
        message: "expected an array of seconds".to_string(),
    })?;
    items
        .iter()
        .map(|v| {
            v.as_integer()
                .filter(|n| *n >= 0)
                .map(|n| n as u64)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "retry delays".to_string(),
                    message: format!("expected a non-negative integer, got {}", v),
                })
        })
        .collect()
}

fn apply_env(settings: &mut Settings) {
    if let Ok(v) = env::var("BANDSTAND_GENERATOR_URL") {
        settings.generator.base_url = v.trim_end_matches('/').to_string();
    }
    if let Ok(v) = env::var("BANDSTAND_GENERATOR_MAX_CONCURRENT") {
        if let Ok(n) = v.parse::<usize>() {
            settings.generator.max_concurrent = n.max(1);
        }
    }
    if let Ok(v) = env::var("BANDSTAND_BIND_ADDR") {
        settings.server.bind_addr = v;
    }
    if let Ok(v) = env::var("BANDSTAND_LOG") {
        settings.log_level = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_files() {
        let settings = Settings::default();
        assert_eq!(settings.generator.cb_threshold, 3);
        assert_eq!(settings.generator.submit_retry_delays_secs, vec![2, 5, 10, 20]);
        assert_eq!(settings.orchestration.max_section_retries, 2);
    }

    #[test]
    fn test_partial_file_overrides_only_named_fields() {
        let file = write_config(
            r#"
            [generator]
            base_url = "http://gen.internal:9000/"
            max_concurrent = 4

            [orchestration]
            max_section_retries = 1
            "#,
        );
        let settings = load_from_file(file.path()).unwrap();
        assert_eq!(settings.generator.base_url, "http://gen.internal:9000");
        assert_eq!(settings.generator.max_concurrent, 4);
        assert_eq!(settings.generator.cb_threshold, 3);
        assert_eq!(settings.orchestration.max_section_retries, 1);
        assert_eq!(settings.orchestration.bass_signal_wait_secs, 60);
    }

    #[test]
    fn test_retry_delay_lists_parse() {
        let file = write_config(
            r#"
            [generator]
            submit_retry_delays_secs = [1, 2, 3]

            [orchestration]
            section_retry_delays_secs = [10]
            "#,
        );
        let settings = load_from_file(file.path()).unwrap();
        assert_eq!(settings.generator.submit_retry_delays_secs, vec![1, 2, 3]);
        assert_eq!(settings.orchestration.section_retry_delays_secs, vec![10]);
    }

    #[test]
    fn test_bad_delay_list_is_rejected() {
        let file = write_config(
            r#"
            [generator]
            submit_retry_delays_secs = ["soon"]
            "#,
        );
        assert!(matches!(
            load_from_file(file.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unparseable_toml_is_an_error() {
        let file = write_config("[generator\nbase_url=");
        assert!(matches!(
            load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
