//! CLI command implementations.

pub mod dump;
pub mod inspect;
pub mod shrink;
pub mod verify;
pub mod version;

use entistore_core::{Config, Engine};
use std::path::Path;

/// Opens an existing store for maintenance.
///
/// No index is declared, so index logs are left untouched.
pub(crate) fn open_existing(path: &Path) -> Result<Engine, Box<dyn std::error::Error>> {
    if !path.join("entities.dat").exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(Engine::open(path, Config::new().create_if_missing(false))?)
}

/// Formats a byte count for humans.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn missing_store_is_reported() {
        let temp = tempdir().unwrap();
        let err = open_existing(temp.path()).unwrap_err();
        assert!(err.to_string().contains("No store found"));
    }
}
