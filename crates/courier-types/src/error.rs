//! Shared error types for the Courier transport layer.

use crate::public_id::PublicId;
use thiserror::Error;

/// Why a `connect()` call could not acquire its backend resources.
///
/// Each variant names exactly one cause so that callers can report it
/// without digging through a generic I/O error.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The external runtime needed to build or run the node is missing.
    #[error("Required runtime '{runtime}' is not installed. {hint}")]
    RuntimeNotInstalled {
        /// The executable that was looked up on `PATH`.
        runtime: String,
        /// Where to get it.
        hint: String,
    },

    /// Fetching or building the node's dependencies failed.
    #[error("Dependency fetch failed: {0}")]
    DependencyFetch(String),

    /// The node process could not be spawned (missing binary, bad path).
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn {
        /// The program that was launched.
        program: String,
        /// The OS-level reason.
        reason: String,
    },

    /// Creating or removing the named pipes failed.
    #[error("Pipe setup failed: {0}")]
    Pipes(String),

    /// A listener could not bind its port.
    #[error("Failed to bind {addr}: {reason}")]
    Bind {
        /// The address that was requested.
        addr: String,
        /// The OS-level reason (usually "address in use").
        reason: String,
    },

    /// The startup artifact or log file could not be written.
    #[error("Failed to write startup files: {0}")]
    StartupFiles(String),

    /// The connection already ran once and must be constructed again.
    #[error("Connection was already used and stopped; construct a new one to reconnect")]
    AlreadyStopped,
}

/// Top-level error type for every transport operation.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Resource acquisition during `connect()` failed.
    #[error("Connection setup failed: {0}")]
    Setup(#[from] SetupError),

    /// The operation requires the `connected` status.
    #[error("Connection {0} is not connected")]
    NotConnected(PublicId),

    /// The envelope's protocol is excluded or not in the allow-list.
    #[error("Protocol {protocol} is not supported by connection {connection}")]
    ProtocolNotSupported {
        /// Protocol of the rejected envelope.
        protocol: PublicId,
        /// The connection that rejected it.
        connection: PublicId,
    },

    /// The peer process exited unexpectedly or could not be reached.
    #[error("Peer process error: {0}")]
    PeerProcess(String),

    /// The IPC stream carried a malformed frame.
    #[error("IPC framing error: {0}")]
    Framing(String),

    /// Static configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The envelope payload is not a message this backend understands.
    #[error("Invalid message for connection {connection}: {reason}")]
    InvalidMessage {
        connection: PublicId,
        reason: String,
    },

    /// An envelope could not be built or decoded.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors building or decoding an [`Envelope`](crate::envelope::Envelope).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// `to` or `sender` was empty.
    #[error("Envelope field '{0}' must not be empty")]
    EmptyAddress(&'static str),

    /// The byte buffer ended in the middle of a field.
    #[error("Truncated envelope: needed {needed} bytes for '{field}', {available} available")]
    Truncated {
        /// The field being read.
        field: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Bytes remained after the last field.
    #[error("Trailing bytes after envelope: {0}")]
    TrailingBytes(usize),

    /// A text field was not valid UTF-8.
    #[error("Field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// The protocol id did not parse.
    #[error("Invalid protocol id: {0}")]
    InvalidProtocolId(String),
}

/// Alias for Result with ConnectionError.
pub type ConnectionResult<T> = Result<T, ConnectionError>;
