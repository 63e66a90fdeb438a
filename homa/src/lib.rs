//! # Homa - low-latency datagram request/response transport
//!
//! This crate implements the transport layer of the Homa message protocol
//! (SIGCOMM 2018): a connectionless request/response
//! transport in which every exchange is an *operation* — a request from a
//! client to a server and an optional reply back — carried over a raw
//! packet [`driver`].
//!
//! ## Features
//!
//! - **Operation-oriented API**: allocate an op, fill the request, send,
//!   watch the op's state, release
//! - **Server delegation**: a server can hand an operation to another
//!   server; the ultimate reply still flows straight to the client
//! - **Grant-paced transmission**: a burst of unscheduled bytes followed
//!   by receiver-driven grants
//! - **Loss recovery**: resends for inbound gaps, pings for quiet
//!   outbound messages, timeouts surfacing as failed ops
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use homa::{LoopbackNetwork, Transport, TransportConfig};
//!
//! let network = LoopbackNetwork::new();
//! let client = Transport::new(Arc::new(network.new_driver()), 1, TransportConfig::default())?;
//! let server = Transport::new(Arc::new(network.new_driver()), 2, TransportConfig::default())?;
//!
//! // Client side: issue a request.
//! let op = client.alloc_op();
//! op.append_payload(b"hello");
//! client.send_request(&op, server.local_address())?;
//!
//! // Server side: service it.
//! server.poll();
//! if let Some(request) = server.receive_op() {
//!     request.append_payload(b"world");
//!     server.send_reply(&request)?;
//!     server.release_op(&request);
//! }
//!
//! // Both sides poll until the op completes, then release it.
//! client.poll();
//! # Ok::<(), homa::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Transport configuration (`TransportConfig`)
//! - [`protocol`]: Wire formats (`Opcode`, `MessageId`, packet headers)
//! - [`driver`]: Raw packet driver abstraction and in-memory loopback
//! - [`message`]: Inbound/outbound message handles
//! - [`op`]: Operation objects and their observable state
//! - [`sender`]: Outbound packetization, grants, pings, retries
//! - [`receiver`]: Inbound reassembly, grants, resend scheduling
//! - [`transport`]: The coordinator binding it all together
//!
//! ## References
//!
//! - [Homa: A Receiver-Driven Low-Latency Transport Protocol (SIGCOMM 2018)](https://dl.acm.org/doi/10.1145/3230543.3230564)

pub mod config;
pub mod driver;
pub mod error;
pub mod message;
pub mod op;
pub mod protocol;
mod receiver;
mod sender;
mod timing;
pub mod transport;

// Re-export main types
pub use config::TransportConfig;
pub use driver::{Address, Driver, LoopbackDriver, LoopbackNetwork, Packet};
pub use error::{Error, Result};
pub use message::{InboundMessage, OutboundMessage, OutboundState};
pub use op::{Op, OpRole, OpState};
pub use protocol::{MessageId, OpId, Opcode, INITIAL_REQUEST_TAG, ULTIMATE_RESPONSE_TAG};
pub use transport::Transport;
