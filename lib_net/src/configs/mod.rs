//! Layered configuration for the bundled binaries: defaults, then an
//! optional JSON file, then environment variables loaded via `.env`.
//! CLI parsing stays in the binaries (clap), which hand the file path in.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::errors::{NetError, Result};

/// Load `.env` into the process environment. Missing files are fine.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => log::debug!("loaded environment from {}", path.display()),
        Err(err) if err.not_found() => {}
        Err(err) => log::warn!("failed to load .env: {err}"),
    }
}

/// Parse a JSON config file into `T`.
pub fn load_json_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|e| {
        NetError::Transport(std::io::Error::new(
            e.kind(),
            format!("config {}: {e}", path.display()),
        ))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| NetError::Protocol(format!("config {}: {e}", path.display())))
}

/// String override from the environment, if set and non-empty.
pub fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        listen_port: u16,
        log_level: Option<String>,
    }

    #[test]
    fn json_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        fs::write(&path, r#"{"listenPort": 9002, "logLevel": "debug"}"#).unwrap();
        let parsed: Sample = load_json_config(&path).unwrap();
        assert_eq!(
            parsed,
            Sample { listen_port: 9002, log_level: Some("debug".into()) }
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load_json_config::<Sample>(&path).is_err());
        assert!(load_json_config::<Sample>(&dir.path().join("missing.json")).is_err());
    }
}
