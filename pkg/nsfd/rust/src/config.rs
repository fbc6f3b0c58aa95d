// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use anyhow::{Context, Result};
use log::warn;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use yaml_rust2::{Yaml, YamlLoader};

use crate::seq::ReportOptions;

const DEFAULT_CONFIG_PATH: &str = "/etc/nsfd/nsfd.yaml";
const DEFAULT_SOCKET_PATH: &str = "/opt/nsfd/run/nsfd.sock";
const DEFAULT_REPORT_USER: &str = "nsfd";

/// Loads the YAML config file if it exists
pub fn load_config(config_path: Option<PathBuf>) -> Result<Option<Yaml>> {
    let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // A missing file is fine, env vars and defaults cover everything.
    if path.exists() {
        let mut file = File::open(&path).context("Failed to open nsfd config file")?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read nsfd config file")?;

        let docs = YamlLoader::load_from_str(&contents).context("Failed to parse YAML config")?;
        Ok(docs.into_iter().next())
    } else {
        warn!(
            "Config file not found at {}. Checking environment variables only.",
            path.display()
        );
        Ok(None)
    }
}

fn get_yaml_value<'a>(doc: &'a Yaml, key: &str) -> Option<&'a Yaml> {
    let mut current = doc;
    for part in key.split('.') {
        current = &current[part];
        if current.is_badvalue() {
            return None;
        }
    }
    Some(current)
}

/// Get string value from YAML, returning Option<String> instead of defaulting to empty string
/// This allows us to distinguish between an empty string and "not set"
fn get_yaml_string_option(doc: &Yaml, key: &str) -> Option<String> {
    get_yaml_value(doc, key)?.as_str().map(|s| s.to_string())
}

/// Non-negative integers only.
fn get_yaml_u64_option(doc: &Yaml, key: &str) -> Option<u64> {
    let value = get_yaml_value(doc, key)?.as_i64()?;
    u64::try_from(value).ok()
}

fn get_env_u64_option(env_var: &str) -> Option<u64> {
    let value = env::var(env_var).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("Ignoring {env_var}={value:?}: {e}");
            None
        }
    }
}

fn get_u64(env_var: &str, yaml_option: &str, config: &Option<Yaml>) -> Option<u64> {
    get_env_u64_option(env_var).or_else(|| {
        config
            .as_ref()
            .and_then(|doc| get_yaml_u64_option(doc, yaml_option))
    })
}

fn get_string(env_var: &str, yaml_option: &str, config: &Option<Yaml>) -> Option<String> {
    if let Ok(value) = env::var(env_var) {
        return Some(value);
    }

    config
        .as_ref()
        .and_then(|doc| get_yaml_string_option(doc, yaml_option))
}

/// Gets the path of the unix socket the report is served on.
pub fn get_socket_path(config: &Option<Yaml>) -> String {
    get_string("NSFD_SOCKET", "nsfd.socket", config)
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string())
}

/// Gets the capacity and buffer limits of report passes.
pub fn get_report_options(config: &Option<Yaml>) -> ReportOptions {
    let defaults = ReportOptions::default();
    let to_usize = |n: u64| usize::try_from(n).ok();

    ReportOptions {
        max_processes: get_u64("NSFD_MAX_PROCESSES", "nsfd.max_processes", config)
            .and_then(to_usize)
            .unwrap_or(defaults.max_processes),
        max_buffer_size: get_u64("NSFD_MAX_BUFFER_SIZE", "nsfd.max_buffer_size", config)
            .and_then(to_usize)
            .unwrap_or(defaults.max_buffer_size),
    }
}

/// Gets the user that owns the report socket.
pub fn get_report_user(config: &Option<Yaml>) -> String {
    get_string("NSFD_REPORT_USER", "nsfd.report_user", config)
        .unwrap_or_else(|| DEFAULT_REPORT_USER.to_string())
}

/// Gets the numeric group that owns the report socket, if one is configured.
pub fn get_report_group(config: &Option<Yaml>) -> Option<u32> {
    get_u64("NSFD_REPORT_GROUP", "nsfd.report_group", config)
        .and_then(|gid| u32::try_from(gid).ok())
}

/// Parse a Go log level string into a log::Level
/// Unknown levels silently default to Info
fn parse_log_level(level: &str) -> log::Level {
    match level.to_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" => log::Level::Error,
        "off" => log::Level::Error, // Rust log crate doesn't have "off", use Error as minimal logging
        _ => log::Level::Info,
    }
}

/// Gets the log level from configuration.
/// Priority: NSFD_LOG_LEVEL > LOG_LEVEL > YAML config > default Info
pub fn get_log_level(config: &Result<Option<Yaml>>) -> log::Level {
    if let Ok(level) = env::var("NSFD_LOG_LEVEL") {
        return parse_log_level(&level);
    }

    if let Ok(level) = env::var("LOG_LEVEL") {
        return parse_log_level(&level);
    }

    config
        .as_ref()
        .ok()
        .and_then(|opt| opt.as_ref())
        .and_then(|doc| get_yaml_string_option(doc, "log_level"))
        .map(|level| parse_log_level(&level))
        .unwrap_or(log::Level::Info)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    use std::io::Write;
    use tempfile::NamedTempFile;

    const NSFD_VARS: [&str; 7] = [
        "NSFD_SOCKET",
        "NSFD_MAX_PROCESSES",
        "NSFD_MAX_BUFFER_SIZE",
        "NSFD_REPORT_USER",
        "NSFD_REPORT_GROUP",
        "NSFD_LOG_LEVEL",
        "LOG_LEVEL",
    ];

    // Helper to create temp config file
    fn create_test_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn load(content: &str) -> Option<Yaml> {
        let config_file = create_test_config(content);
        load_config(Some(config_file.path().to_path_buf())).unwrap()
    }

    fn without_nsfd_env<R>(f: impl FnOnce() -> R) -> R {
        temp_env::with_vars(NSFD_VARS.map(|var| (var, None::<&str>)), f)
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path().join("missing.yaml"))).unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn test_invalid_yaml() {
        let config_file = create_test_config("invalid: yaml: content:\n  bad indentation");
        let config = load_config(Some(config_file.path().to_path_buf()));
        assert!(config.is_err());
    }

    #[test]
    fn test_defaults_when_no_config() {
        without_nsfd_env(|| {
            assert_eq!(get_socket_path(&None), "/opt/nsfd/run/nsfd.sock");
            assert_eq!(get_report_options(&None), ReportOptions::default());
            assert_eq!(get_report_user(&None), "nsfd");
            assert_eq!(get_report_group(&None), None);
        });
    }

    #[test]
    fn test_values_from_yaml() {
        without_nsfd_env(|| {
            let config = load(
                r#"
nsfd:
  socket: /yaml/nsfd.sock
  max_processes: 16
  max_buffer_size: 65536
  report_user: reporter
  report_group: 1234
"#,
            );
            assert_eq!(get_socket_path(&config), "/yaml/nsfd.sock");
            assert_eq!(
                get_report_options(&config),
                ReportOptions {
                    max_processes: 16,
                    max_buffer_size: 65536
                }
            );
            assert_eq!(get_report_user(&config), "reporter");
            assert_eq!(get_report_group(&config), Some(1234));
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        let config = load(
            r#"
nsfd:
  socket: /yaml/nsfd.sock
  max_processes: 16
  report_group: 1234
"#,
        );
        temp_env::with_vars(
            [
                ("NSFD_SOCKET", Some("/env/nsfd.sock")),
                ("NSFD_MAX_PROCESSES", Some("32")),
                ("NSFD_REPORT_GROUP", Some("42")),
            ],
            || {
                assert_eq!(get_socket_path(&config), "/env/nsfd.sock");
                assert_eq!(get_report_options(&config).max_processes, 32);
                assert_eq!(get_report_group(&config), Some(42));
            },
        );
    }

    #[test]
    fn test_invalid_env_number_falls_back_to_yaml() {
        let config = load("nsfd:\n  max_processes: 16\n");
        temp_env::with_var("NSFD_MAX_PROCESSES", Some("lots"), || {
            assert_eq!(get_report_options(&config).max_processes, 16);
        });
    }

    #[test]
    fn test_negative_yaml_number_uses_default() {
        without_nsfd_env(|| {
            let config = load("nsfd:\n  max_processes: -1\n  report_group: -5\n");
            assert_eq!(get_report_options(&config).max_processes, 1024);
            assert_eq!(get_report_group(&config), None);
        });
    }

    #[test]
    fn test_yaml_wrong_type_uses_default() {
        without_nsfd_env(|| {
            let config = load("nsfd:\n  socket: 12345\n");
            assert_eq!(get_socket_path(&config), "/opt/nsfd/run/nsfd.sock");
        });
    }

    #[test]
    fn test_get_log_level_default_when_no_config() {
        without_nsfd_env(|| {
            assert_eq!(get_log_level(&Ok(None)), log::Level::Info);
        });
    }

    #[test]
    fn test_get_log_level_nsfd_log_level_overrides_log_level() {
        temp_env::with_vars(
            vec![
                ("NSFD_LOG_LEVEL", Some("error")),
                ("LOG_LEVEL", Some("trace")),
            ],
            || {
                assert_eq!(
                    get_log_level(&Ok(None)),
                    log::Level::Error,
                    "NSFD_LOG_LEVEL should take priority over LOG_LEVEL"
                );
            },
        );
    }

    #[test]
    fn test_get_log_level_from_log_level_env_fallback() {
        temp_env::with_vars(
            vec![("NSFD_LOG_LEVEL", None::<&str>), ("LOG_LEVEL", Some("trace"))],
            || {
                assert_eq!(get_log_level(&Ok(None)), log::Level::Trace);
            },
        );
    }

    #[test]
    fn test_get_log_level_from_yaml() {
        without_nsfd_env(|| {
            let config_file = create_test_config("log_level: warn\n");
            let config = load_config(Some(config_file.path().to_path_buf()));
            assert_eq!(get_log_level(&config), log::Level::Warn);
        });
    }

    #[test]
    fn test_get_log_level_with_invalid_yaml() {
        without_nsfd_env(|| {
            let config_file = create_test_config("invalid: yaml: content:\n  bad");
            let config = load_config(Some(config_file.path().to_path_buf()));
            assert_eq!(get_log_level(&config), log::Level::Info);
        });
    }

    #[test]
    fn test_parse_log_level_go_names() {
        assert_eq!(parse_log_level("WARNING"), log::Level::Warn);
        assert_eq!(parse_log_level("critical"), log::Level::Error);
        assert_eq!(parse_log_level("off"), log::Level::Error);
        assert_eq!(parse_log_level("verbose"), log::Level::Info);
    }
}
