//! `host:port` node URIs.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network location of an overlay node, written `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri {
    host: String,
    port: u16,
}

impl Uri {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// A loopback URI on a random port in `5000..10000`.
    pub fn random_local() -> Self {
        let port = rand::thread_rng().gen_range(5000..10000);
        Self::new("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Uri {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("URI '{s}' is not of the form host:port"))?;
        if host.is_empty() {
            return Err(format!("URI '{s}' has an empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("URI '{s}' has an invalid port: {e}"))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Uri {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let uri: Uri = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(uri.host(), "127.0.0.1");
        assert_eq!(uri.port(), 9000);
        assert_eq!(uri.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_rejects_bad_uris() {
        assert!("localhost".parse::<Uri>().is_err());
        assert!(":9000".parse::<Uri>().is_err());
        assert!("host:99999".parse::<Uri>().is_err());
    }

    #[test]
    fn test_random_local_range() {
        for _ in 0..20 {
            let uri = Uri::random_local();
            assert_eq!(uri.host(), "127.0.0.1");
            assert!((5000..10000).contains(&uri.port()));
        }
    }
}
