//! Courier overlay transport.
//!
//! Runs a peer-to-peer overlay node as a child process and talks to it over
//! a pair of named pipes carrying length-prefixed envelopes.
//!
//! ## Architecture
//!
//! - **OverlayConnection**: the [`courier_types::Connection`] the agent uses
//! - **OverlayNode**: spawns and supervises the node process
//! - **pipe** / **frame**: FIFO plumbing and the 4-byte length framing
//! - **mesh**: the reference node run by the `courier-node` binary

pub mod connection;
pub mod env;
pub mod error;
pub mod frame;
pub mod mesh;
pub mod message;
pub mod node;
pub mod pipe;
pub mod process;
pub mod registry;
pub mod uri;

pub use connection::{OverlayConnection, OverlaySettings, PUBLIC_ID};
pub use env::NodeEnv;
pub use error::WireError;
pub use message::MeshMessage;
pub use node::{NodeConfig, NodeState, OverlayNode};
pub use pipe::{PipePaths, RetryPolicy};
pub use process::NodeLauncher;
pub use registry::PeerRegistry;
pub use uri::Uri;
