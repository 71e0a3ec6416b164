//! User configuration lookup for reply-router.
//!
//! User config location: $XDG_CONFIG_HOME/reply-router/reply-router.toml
//! Fallback: the platform config directory (`dirs::config_dir()`)

use std::path::{Path, PathBuf};

use super::settings::{ConfigResult, Settings};

const APP_DIR: &str = "reply-router";
const CONFIG_FILE: &str = "reply-router.toml";

/// Returns the path to the user configuration file.
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg_config) if !xdg_config.is_empty() => {
            return Some(PathBuf::from(xdg_config).join(APP_DIR).join(CONFIG_FILE));
        }
        _ => {}
    }

    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Resolve the effective settings.
///
/// An explicit path must exist. Without one, the user config file is used when
/// present, and built-in defaults otherwise.
pub fn load_settings(explicit: Option<&Path>) -> ConfigResult<Settings> {
    if let Some(path) = explicit {
        return Settings::load(path);
    }

    match user_config_path() {
        Some(path) if path.is_file() => {
            log::info!(
                target: "reply_router::config",
                "Loading configuration from {}",
                path.display()
            );
            Settings::load(&path)
        }
        _ => Ok(Settings::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, ReplyStrategy};
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::io::Write;

    #[test]
    fn explicit_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "call_timeout_ms = 1500").unwrap();

        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.call_timeout_ms, 1500);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(
            load_settings(Some(&path)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_path_uses_xdg_config_home_when_set() {
        let original = env::var("XDG_CONFIG_HOME").ok();

        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            env::set_var("XDG_CONFIG_HOME", "/custom/config");
        }
        let path = user_config_path();
        restore_xdg(original);

        assert_eq!(
            path,
            Some(PathBuf::from("/custom/config/reply-router/reply-router.toml"))
        );
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_file_is_picked_up_without_explicit_path() {
        let original = env::var("XDG_CONFIG_HOME").ok();
        let config_home = tempfile::tempdir().unwrap();
        let app_dir = config_home.path().join("reply-router");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            app_dir.join("reply-router.toml"),
            "reply_strategy = \"per_call\"\n",
        )
        .unwrap();

        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            env::set_var("XDG_CONFIG_HOME", config_home.path());
        }
        let outcome = load_settings(None);
        restore_xdg(original);

        let settings = outcome.unwrap();
        assert_eq!(settings.reply_strategy, ReplyStrategy::PerCall);
        assert_eq!(settings.call_timeout_ms, 5_000);
    }

    #[test]
    #[serial(xdg_env)]
    fn absent_user_config_falls_back_to_defaults() {
        let original = env::var("XDG_CONFIG_HOME").ok();
        let config_home = tempfile::tempdir().unwrap();

        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            env::set_var("XDG_CONFIG_HOME", config_home.path());
        }
        let outcome = load_settings(None);
        restore_xdg(original);

        assert_eq!(outcome.unwrap(), Settings::default());
    }

    fn restore_xdg(original: Option<String>) {
        // SAFETY: only called from #[serial(xdg_env)] tests
        unsafe {
            match original {
                Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }
    }
}
