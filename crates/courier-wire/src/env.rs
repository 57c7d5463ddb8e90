//! Startup artifact handed to the overlay node process.
//!
//! The manager writes an env file of `KEY=VALUE` lines and passes its path as
//! the node's first argument; the same pairs are also exported into the
//! child's environment. The node reads either form.

use crate::error::WireError;
use crate::uri::Uri;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Secret key hex followed by public key hex.
pub const ENV_IDENTITY: &str = "COURIER_P2P_ID";
/// The node's own bind URI.
pub const ENV_BIND_URI: &str = "COURIER_P2P_URI";
/// Comma-separated bootstrap peers.
pub const ENV_ENTRY_URIS: &str = "COURIER_P2P_ENTRY_URIS";
/// Pipe the node writes and the agent reads.
pub const ENV_NODE_TO_AGENT: &str = "NODE_TO_AGENT";
/// Pipe the agent writes and the node reads.
pub const ENV_AGENT_TO_NODE: &str = "AGENT_TO_NODE";

/// Everything a node process needs to start.
pub struct NodeEnv {
    pub identity: Zeroizing<String>,
    pub bind_uri: Uri,
    pub entry_uris: Vec<Uri>,
    pub node_to_agent: PathBuf,
    pub agent_to_node: PathBuf,
}

impl fmt::Debug for NodeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEnv")
            .field("identity", &"<redacted>")
            .field("bind_uri", &self.bind_uri)
            .field("entry_uris", &self.entry_uris)
            .field("node_to_agent", &self.node_to_agent)
            .field("agent_to_node", &self.agent_to_node)
            .finish()
    }
}

impl NodeEnv {
    /// Build the startup values. A node never bootstraps from itself, so any
    /// entry equal to `bind_uri` is dropped.
    pub fn new(
        identity: Zeroizing<String>,
        bind_uri: Uri,
        entry_uris: &[Uri],
        node_to_agent: PathBuf,
        agent_to_node: PathBuf,
    ) -> Self {
        let entry_uris = entry_uris
            .iter()
            .filter(|uri| **uri != bind_uri)
            .cloned()
            .collect();
        Self {
            identity,
            bind_uri,
            entry_uris,
            node_to_agent,
            agent_to_node,
        }
    }

    /// The key/value pairs, in file order.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_IDENTITY, self.identity.to_string()),
            (ENV_BIND_URI, self.bind_uri.to_string()),
            (
                ENV_ENTRY_URIS,
                self.entry_uris
                    .iter()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            (ENV_NODE_TO_AGENT, self.node_to_agent.display().to_string()),
            (ENV_AGENT_TO_NODE, self.agent_to_node.display().to_string()),
        ]
    }

    /// Render as env file text.
    pub fn render(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::new());
        for (key, value) in self.vars() {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Write the env file, replacing any previous one.
    pub fn write_file(&self, path: &Path) -> std::io::Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        std::fs::write(path, self.render().as_bytes())
    }

    /// Parse env file text.
    pub fn parse(contents: &str) -> Result<Self, WireError> {
        let vars: HashMap<String, String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Read an env file from disk.
    pub fn from_file(path: &Path) -> Result<Self, WireError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            WireError::Environment(format!("cannot read {}: {e}", path.display()))
        })?);
        Self::parse(&contents)
    }

    /// Read the values from this process's environment.
    pub fn from_process_env() -> Result<Self, WireError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WireError> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| WireError::Environment(format!("missing {key}")))
        };
        let identity = Zeroizing::new(require(ENV_IDENTITY)?);
        let bind_uri = require(ENV_BIND_URI)?
            .parse::<Uri>()
            .map_err(WireError::Environment)?;
        let entry_uris = lookup(ENV_ENTRY_URIS)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Uri>().map_err(WireError::Environment))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            identity,
            bind_uri,
            &entry_uris,
            PathBuf::from(require(ENV_NODE_TO_AGENT)?),
            PathBuf::from(require(ENV_AGENT_TO_NODE)?),
        ))
    }
}
