//! User settings for the notebook runner.
//!
//! Stored as JSON in the user's config directory:
//! - macOS: ~/Library/Application Support/nteract-kernel-notebook/settings.json
//! - Linux: ~/.config/nteract-kernel-notebook/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\nteract-kernel-notebook\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use jupyter_server::ServerConfig;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Kernel spec used when a document or command names none.
    #[serde(default = "default_kernel")]
    pub default_kernel: String,

    /// Program launched when no running server is discovered.
    #[serde(default = "default_server_command")]
    pub server_command: String,

    #[serde(default = "default_server_args", deserialize_with = "deserialize_args")]
    pub server_args: Vec<String>,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Cancel the rest of a run once a cell raises.
    #[serde(default = "default_true")]
    pub stop_on_error: bool,

    /// Prefix that sends a code cell to the shell instead of the kernel.
    #[serde(default = "default_shell_escape_sigil")]
    pub shell_escape_sigil: String,
}

fn default_kernel() -> String {
    "python3".to_string()
}

fn default_server_command() -> String {
    "jupyter".to_string()
}

fn default_server_args() -> Vec<String> {
    vec!["server".to_string(), "--no-browser".to_string()]
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_shell_escape_sigil() -> String {
    "!".to_string()
}

/// Accepts `["server", "--no-browser"]` or the shell-ish `"server --no-browser"`.
fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ArgsVisitor;

    impl<'de> de::Visitor<'de> for ArgsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut args = Vec::new();
            while let Some(arg) = seq.next_element::<String>()? {
                args.push(arg);
            }
            Ok(args)
        }
    }

    deserializer.deserialize_any(ArgsVisitor)
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_kernel: default_kernel(),
            server_command: default_server_command(),
            server_args: default_server_args(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            stop_on_error: true,
            shell_escape_sigil: default_shell_escape_sigil(),
        }
    }
}

impl AppSettings {
    /// Server configuration with these settings applied over the defaults.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            command: self.server_command.clone(),
            args: self.server_args.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms),
            ..ServerConfig::default()
        }
    }
}

pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nteract-kernel-notebook")
        .join("settings.json")
}

pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_path())
}

/// Defaults when the file is missing or unreadable.
pub fn load_settings_from(path: &Path) -> AppSettings {
    let Ok(content) = std::fs::read_to_string(path) else {
        return AppSettings::default();
    };
    match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[settings] Ignoring {}: {}", path.display(), e);
            AppSettings::default()
        }
    }
}

/// Load the settings file, apply `change` and write the result back.
pub fn update_settings(change: impl FnOnce(&mut AppSettings)) -> Result<AppSettings> {
    update_settings_at(&settings_path(), change)
}

pub fn update_settings_at(
    path: &Path,
    change: impl FnOnce(&mut AppSettings),
) -> Result<AppSettings> {
    let mut settings = load_settings_from(path);
    change(&mut settings);
    save_settings_to(path, &settings)?;
    info!("[settings] Saved {}", path.display());
    Ok(settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.default_kernel, "python3");
        assert_eq!(settings.server_command, "jupyter");
        assert_eq!(settings.server_args, vec!["server", "--no-browser"]);
        assert!(settings.stop_on_error);
        assert_eq!(settings.shell_escape_sigil, "!");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"default_kernel": "ir", "stop_on_error": false}"#).unwrap();
        assert_eq!(settings.default_kernel, "ir");
        assert!(!settings.stop_on_error);
        assert_eq!(settings.reconcile_interval_ms, 1000);
        assert_eq!(settings.request_timeout_secs, 10);
    }

    #[test]
    fn test_server_args_accept_string() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"server_args": "lab --no-browser --port 9999"}"#).unwrap();
        assert_eq!(
            settings.server_args,
            vec!["lab", "--no-browser", "--port", "9999"]
        );
    }

    #[test]
    fn test_to_server_config() {
        let settings = AppSettings {
            server_command: "/opt/jupyter".into(),
            reconcile_interval_ms: 2000,
            request_timeout_secs: 3,
            ..Default::default()
        };
        let config = settings.to_server_config();
        assert_eq!(config.command, "/opt/jupyter");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_unreadable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings_from(&path), AppSettings::default());

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            default_kernel: "julia-1.10".into(),
            shell_escape_sigil: "%".into(),
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_update_keeps_untouched_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server_command": "/opt/jupyter"}"#).unwrap();

        let updated = update_settings_at(&path, |s| s.default_kernel = "ir".into()).unwrap();
        assert_eq!(updated.default_kernel, "ir");
        assert_eq!(updated.server_command, "/opt/jupyter");
        assert_eq!(load_settings_from(&path), updated);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_settings_path_follows_xdg_config_home() {
        let dir = tempfile::tempdir().unwrap();
        let previous = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());

        let path = settings_path();

        match previous {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        assert_eq!(
            path,
            dir.path().join("nteract-kernel-notebook").join("settings.json")
        );
    }
}
