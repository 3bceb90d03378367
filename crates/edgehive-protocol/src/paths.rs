use std::path::{Path, PathBuf};

const DEFAULT_STATE_DIR: &str = ".local/state/edgehive";
const DATABASE_FILE: &str = "edgehive.db";

/// State directory for persistent node data.
///
/// Priority: `$EDGEHIVE_STATE_DIR`, then `~/.local/state/edgehive`, then
/// `/tmp/edgehive`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("EDGEHIVE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(DEFAULT_STATE_DIR),
        Err(_) => PathBuf::from("/tmp/edgehive"),
    }
}

/// SQLite database inside a state directory.
pub fn database_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DATABASE_FILE)
}

/// Config file path for the edge daemon.
pub fn config_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("edgehive").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("edgehive")
            .join("config.toml")
    } else {
        PathBuf::from("/etc/edgehive/config.toml")
    }
}
