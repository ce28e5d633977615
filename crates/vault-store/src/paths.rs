use std::env;
use std::path::PathBuf;

pub const DB_FILE: &str = "vault.db";

/// Default base directory for vault data and configuration.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".vault")
}

pub fn default_db_path() -> PathBuf {
    default_base_dir().join(DB_FILE)
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
