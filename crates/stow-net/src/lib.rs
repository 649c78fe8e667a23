//! Graph exchange over TCP for stowage.
//!
//! A message is one length-prefixed frame holding a whole object graph: the
//! type layouts it uses followed by one binary record per object, root
//! first. The protocol is strictly request/response: a client connects,
//! sends one graph, reads one reply graph and closes. Servers keep no state
//! between connections.
//!
//! Every read and write runs against a progress timeout (see [`frame`]), so
//! a stalled or vanished peer surfaces as the retryable
//! [`NetError::Timeout`].

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;

pub use client::NetworkClient;
pub use config::NetworkConfig;
pub use error::{NetError, NetResult};
pub use frame::{read_frame, write_frame, FRAME_HEADER_SIZE};
pub use message::GraphMessage;
pub use server::{GraphHandler, NetworkServer};
