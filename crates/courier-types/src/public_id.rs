//! Package and protocol identifiers.
//!
//! A [`PublicId`] has the string form `author/name:version`, where `version`
//! is either a concrete version string or the `latest` sentinel. An optional
//! content hash can be attached but never takes part in the string form.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// The sentinel that matches any concrete version.
pub const LATEST: &str = "latest";

/// Version component of a [`PublicId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// The `latest` sentinel.
    Latest,
    /// A concrete version string such as `0.1.0`.
    Exact(String),
}

impl Version {
    /// Whether this is the `latest` sentinel.
    pub fn is_latest(&self) -> bool {
        matches!(self, Version::Latest)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Latest => f.write_str(LATEST),
            Version::Exact(v) => f.write_str(v),
        }
    }
}

/// Identifier of a package or protocol: `author/name:version`.
///
/// Equality, hashing and ordering look at `author`, `name` and `version`
/// only, so an id compares equal to its own string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicId {
    author: String,
    name: String,
    version: Version,
    hash: Option<String>,
}

impl PublicId {
    /// Build a public id, validating `author` and `name`.
    pub fn new(
        author: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, String> {
        let author = author.into();
        let name = name.into();
        let version = version.into();
        validate_identifier("author", &author)?;
        validate_identifier("name", &name)?;
        if version.is_empty() {
            return Err("version must not be empty".to_string());
        }
        let version = if version == LATEST {
            Version::Latest
        } else {
            Version::Exact(version)
        };
        Ok(Self {
            author,
            name,
            version,
            hash: None,
        })
    }

    /// Attach a content hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    fn key(&self) -> (&str, &str, &Version) {
        (&self.author, &self.name, &self.version)
    }

    /// True when author and name match, regardless of version.
    pub fn same_prefix(&self, other: &PublicId) -> bool {
        self.author == other.author && self.name == other.name
    }

    /// True when the prefixes match and either side is `latest` or both
    /// versions are equal.
    pub fn is_version_compatible(&self, other: &PublicId) -> bool {
        self.same_prefix(other)
            && (self.version.is_latest()
                || other.version.is_latest()
                || self.version == other.version)
    }
}

impl PartialEq for PublicId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PublicId {}

impl Hash for PublicId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for PublicId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), String> {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(format!(
                "{field} '{value}' must start with a letter or underscore"
            ))
        }
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Ok(())
    } else {
        Err(format!("{field} '{value}' contains invalid characters"))
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.author, self.name, self.version)
    }
}

impl FromStr for PublicId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (author, rest) = s
            .split_once('/')
            .ok_or_else(|| format!("'{s}' is not of the form author/name:version"))?;
        let (name, version) = rest
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not of the form author/name:version"))?;
        PublicId::new(author, name, version)
    }
}

impl TryFrom<String> for PublicId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicId> for String {
    fn from(id: PublicId) -> Self {
        id.to_string()
    }
}
