//! Path resolution for stagecraft
//!
//! # Environment Variables
//!
//! - `STAGECRAFT_CONFIG_DIR` - Override the config directory holding
//!   `settings.toml`
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STAGECRAFT_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/stagecraft` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\stagecraft`
//!    - macOS/Linux: `~/.config/stagecraft`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STAGECRAFT_CONFIG_DIR";

const APP_DIR: &str = "stagecraft";

/// Get the stagecraft config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join(APP_DIR));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Expand `~` and environment variables in a path
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expand a path, then anchor it at `base` when relative
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Run `f` with an env var temporarily set
    ///
    /// # Safety
    /// Uses unsafe env::set_var/remove_var; only call from tests that do not
    /// read the same variable concurrently.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/stagecraft", || {
            assert_eq!(config_dir().unwrap(), PathBuf::from("/custom/stagecraft"));
        });
    }

    #[test]
    fn test_expand_with_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand("~/plans"), home.join("plans"));
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        assert_eq!(
            expand("$STAGECRAFT_SURELY_UNSET_VAR/x"),
            PathBuf::from("$STAGECRAFT_SURELY_UNSET_VAR/x")
        );
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let base = Path::new("/srv/plans");
        assert_eq!(
            resolve(base, Path::new("data/plan.toml")),
            PathBuf::from("/srv/plans/data/plan.toml")
        );
        assert_eq!(
            resolve(base, Path::new("/etc/plan.toml")),
            PathBuf::from("/etc/plan.toml")
        );
    }
}
