//! Connection configuration loaded from TOML.
//!
//! A transport config file lists one `[[connections]]` table per backend:
//!
//! ```toml
//! [[connections]]
//! connection_id = "courier/p2p_overlay:0.1.0"
//! excluded_protocols = ["courier/http:0.1.0"]
//!
//! [connections.config]
//! host = "127.0.0.1"
//! port = 9000
//! entry_peers = []
//! ```
//!
//! The free-form `config` table is interpreted by each backend through
//! [`ConnectionConfig::settings`].

use crate::error::{ConnectionError, ConnectionResult};
use crate::public_id::PublicId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Static configuration of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Identifier of the connection package.
    pub connection_id: PublicId,
    /// If non-empty, only these protocols may pass.
    #[serde(default)]
    pub restricted_to_protocols: BTreeSet<PublicId>,
    /// These protocols never pass.
    #[serde(default)]
    pub excluded_protocols: BTreeSet<PublicId>,
    /// Backend-specific settings.
    #[serde(default)]
    pub config: toml::Table,
}

impl ConnectionConfig {
    /// A config with no filters and no settings.
    pub fn new(connection_id: PublicId) -> Self {
        Self {
            connection_id,
            restricted_to_protocols: BTreeSet::new(),
            excluded_protocols: BTreeSet::new(),
            config: toml::Table::new(),
        }
    }

    /// Deserialize the backend-specific table into a typed settings struct.
    pub fn settings<T: DeserializeOwned>(&self) -> ConnectionResult<T> {
        toml::Value::Table(self.config.clone())
            .try_into()
            .map_err(|e| {
                ConnectionError::InvalidConfig(format!(
                    "connection {}: {e}",
                    self.connection_id
                ))
            })
    }
}

/// All connections of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl TransportConfig {
    /// Find the config of a given connection.
    pub fn connection(&self, connection_id: &PublicId) -> Option<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|c| &c.connection_id == connection_id)
    }
}

/// Parse a transport config from TOML text.
pub fn parse_transport_config(contents: &str) -> ConnectionResult<TransportConfig> {
    let config: TransportConfig =
        toml::from_str(contents).map_err(|e| ConnectionError::InvalidConfig(e.to_string()))?;

    let mut seen = BTreeSet::new();
    for conn in &config.connections {
        if !seen.insert(conn.connection_id.clone()) {
            return Err(ConnectionError::InvalidConfig(format!(
                "duplicate connection id {}",
                conn.connection_id
            )));
        }
    }
    Ok(config)
}

/// Load a transport config file. Unlike agent-level defaults, a missing or
/// malformed file is an error: connections cannot be guessed.
pub fn load_transport_config(path: &Path) -> ConnectionResult<TransportConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ConnectionError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
    })?;
    let config = parse_transport_config(&contents)?;
    info!(
        path = %path.display(),
        connections = config.connections.len(),
        "Loaded transport configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[connections]]
connection_id = "courier/p2p_overlay:0.1.0"
excluded_protocols = ["courier/http:0.1.0"]

[connections.config]
host = "127.0.0.1"
port = 9000
entry_peers = ["127.0.0.1:9001"]

[[connections]]
connection_id = "courier/http_client:0.1.0"
restricted_to_protocols = ["courier/http:0.1.0"]
"#;

    #[derive(Debug, Deserialize)]
    struct OverlayBits {
        host: String,
        port: u16,
        entry_peers: Vec<String>,
    }

    #[test]
    fn test_parse_sample() {
        let config = parse_transport_config(SAMPLE).unwrap();
        assert_eq!(config.connections.len(), 2);
        let overlay = &config.connections[0];
        assert_eq!(overlay.excluded_protocols.len(), 1);
        let bits: OverlayBits = overlay.settings().unwrap();
        assert_eq!(bits.host, "127.0.0.1");
        assert_eq!(bits.port, 9000);
        assert_eq!(bits.entry_peers, vec!["127.0.0.1:9001"]);

        let http = config
            .connection(&"courier/http_client:0.1.0".parse().unwrap())
            .unwrap();
        assert!(http.config.is_empty());
        assert_eq!(http.restricted_to_protocols.len(), 1);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let dup = r#"
[[connections]]
connection_id = "courier/http_client:0.1.0"
[[connections]]
connection_id = "courier/http_client:0.1.0"
"#;
        let err = parse_transport_config(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_bad_settings_type() {
        let config = parse_transport_config(SAMPLE).unwrap();
        let err = config.connections[1].settings::<OverlayBits>().unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_transport_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_transport_config(&path).unwrap();
        assert_eq!(config.connections.len(), 2);
    }
}
