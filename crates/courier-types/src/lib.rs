//! Core types and traits for the Courier agent transport layer.
//!
//! This crate defines the envelope and addressing model, the connection
//! contract every transport backend implements, the shared error taxonomy,
//! node identity keys and configuration loading. It contains no transport
//! logic.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod public_id;

pub use connection::{Connection, ConnectionState, ConnectionStatus};
pub use envelope::{Address, Envelope, RoutingContext};
pub use error::{ConnectionError, ConnectionResult, EnvelopeError, SetupError};
pub use identity::KeyPair;
pub use public_id::PublicId;
