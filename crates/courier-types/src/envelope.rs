//! Envelopes: the unit of transport between agent logic and connections.
//!
//! The byte encoding is a concatenation of four fields, each prefixed with a
//! 4-byte big-endian length: `to`, `sender`, `protocol_id` (string form) and
//! `message`. The routing context is a local hint for the multiplexer and is
//! never put on the wire.

use crate::error::EnvelopeError;
use crate::public_id::PublicId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque participant address. Equality is exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Routing hint attached to an outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingContext {
    /// Connection the envelope should leave through, if the sender cares.
    pub connection_id: Option<PublicId>,
}

impl RoutingContext {
    pub fn for_connection(connection_id: PublicId) -> Self {
        Self {
            connection_id: Some(connection_id),
        }
    }
}

/// An addressed, protocol-tagged message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    to: Address,
    sender: Address,
    protocol_id: PublicId,
    message: Vec<u8>,
    context: Option<RoutingContext>,
}

impl Envelope {
    /// Build an envelope. `to` and `sender` must be non-empty.
    pub fn new(
        to: impl Into<Address>,
        sender: impl Into<Address>,
        protocol_id: PublicId,
        message: impl Into<Vec<u8>>,
    ) -> Result<Self, EnvelopeError> {
        let to = to.into();
        let sender = sender.into();
        if to.is_empty() {
            return Err(EnvelopeError::EmptyAddress("to"));
        }
        if sender.is_empty() {
            return Err(EnvelopeError::EmptyAddress("sender"));
        }
        Ok(Self {
            to,
            sender,
            protocol_id,
            message: message.into(),
            context: None,
        })
    }

    /// Return a copy carrying the given routing context.
    pub fn with_context(mut self, context: RoutingContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn protocol_id(&self) -> &PublicId {
        &self.protocol_id
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn context(&self) -> Option<&RoutingContext> {
        self.context.as_ref()
    }

    /// The connection named by the routing context, if any.
    pub fn target_connection(&self) -> Option<&PublicId> {
        self.context.as_ref().and_then(|c| c.connection_id.as_ref())
    }

    /// Encode to the stable length-prefixed byte form.
    pub fn encode(&self) -> Vec<u8> {
        let protocol = self.protocol_id.to_string();
        let fields: [&[u8]; 4] = [
            self.to.as_str().as_bytes(),
            self.sender.as_str().as_bytes(),
            protocol.as_bytes(),
            &self.message,
        ];
        let total: usize = fields.iter().map(|f| 4 + f.len()).sum();
        let mut out = Vec::with_capacity(total);
        for field in fields {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out
    }

    /// Decode bytes produced by [`Envelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let to = cursor.text("to")?;
        let sender = cursor.text("sender")?;
        let protocol = cursor.text("protocol_id")?;
        let message = cursor.field("message")?.to_vec();
        let trailing = bytes.len() - cursor.pos;
        if trailing > 0 {
            return Err(EnvelopeError::TrailingBytes(trailing));
        }
        let protocol_id = protocol
            .parse::<PublicId>()
            .map_err(EnvelopeError::InvalidProtocolId)?;
        Envelope::new(to, sender, protocol_id, message)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope(to={}, sender={}, protocol_id={}, message={} bytes)",
            self.to,
            self.sender,
            self.protocol_id,
            self.message.len()
        )
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let available = self.bytes.len() - self.pos;
        if available < n {
            return Err(EnvelopeError::Truncated {
                field,
                needed: n,
                available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn field(&mut self, field: &'static str) -> Result<&'a [u8], EnvelopeError> {
        let header = self.take(field, 4)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        self.take(field, len)
    }

    fn text(&mut self, field: &'static str) -> Result<String, EnvelopeError> {
        let raw = self.field(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8(field))
    }
}
