//! Packet driver abstraction.
//!
//! The transport sits on top of a [`Driver`] that only knows how to move
//! raw datagrams. Packet reception happens from the poll thread; packet
//! transmission may happen from any thread, so implementations must be
//! thread-safe.
//!
//! [`LoopbackNetwork`] provides an in-memory implementation connecting any
//! number of drivers in one process, used by the tests and benches.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::protocol::RAW_ADDRESS_SIZE;

/// Network address of a transport endpoint.
///
/// Addresses travel on the wire in their raw byte form (for example in the
/// reply-address field of a message header); `from_raw` and `to_raw` are
/// the symmetric conversions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    raw: [u8; RAW_ADDRESS_SIZE],
}

impl Address {
    /// Construct an address from its raw wire form.
    pub fn from_raw(raw: [u8; RAW_ADDRESS_SIZE]) -> Self {
        Self { raw }
    }

    /// The raw wire form of this address.
    pub fn to_raw(&self) -> [u8; RAW_ADDRESS_SIZE] {
        self.raw
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", u64::from_le_bytes(self.raw))
    }
}

/// A received datagram.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Address the packet came from.
    pub source: Address,
    /// Raw packet bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Length of the packet in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the packet carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Raw datagram send/receive interface.
pub trait Driver: Send + Sync {
    /// Send one datagram to `destination`. Best effort; the protocol's
    /// retry machinery covers losses.
    fn send_packet(&self, destination: Address, payload: &[u8]) -> Result<()>;

    /// Receive up to `max_packets` pending datagrams without blocking.
    fn receive_packets(&self, max_packets: usize) -> Vec<Packet>;

    /// The address of this driver's endpoint.
    fn local_address(&self) -> Address;

    /// Largest datagram payload this driver can carry.
    ///
    /// Must exceed the DATA header size; `Transport::new` rejects
    /// drivers that cannot carry a DATA packet.
    fn max_payload_size(&self) -> usize;
}

/// Default datagram size limit for the loopback network.
pub const LOOPBACK_MAX_PAYLOAD: usize = 1024;

/// In-memory datagram network.
///
/// Every driver created from the network gets its own address and receive
/// queue. Packets sent to an address without a driver are dropped, which is
/// how the tests simulate an unreachable peer.
pub struct LoopbackNetwork {
    queues: Mutex<HashMap<Address, VecDeque<Packet>>>,
    next_address: AtomicU64,
    max_payload: usize,
}

impl LoopbackNetwork {
    /// Create a new network with the default payload limit.
    pub fn new() -> Arc<Self> {
        Self::with_max_payload(LOOPBACK_MAX_PAYLOAD)
    }

    /// Create a new network with the given payload limit.
    pub fn with_max_payload(max_payload: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(1),
            max_payload,
        })
    }

    /// Create a driver attached to this network with a fresh address.
    pub fn new_driver(self: &Arc<Self>) -> LoopbackDriver {
        let raw = self.next_address.fetch_add(1, Ordering::Relaxed);
        let address = Address::from_raw(raw.to_le_bytes());
        self.queues
            .lock()
            .unwrap()
            .insert(address, VecDeque::new());
        LoopbackDriver {
            network: Arc::clone(self),
            address,
        }
    }

    /// Total number of packets queued anywhere on the network.
    pub fn packets_in_flight(&self) -> usize {
        self.queues.lock().unwrap().values().map(|q| q.len()).sum()
    }
}

/// One endpoint of a [`LoopbackNetwork`].
pub struct LoopbackDriver {
    network: Arc<LoopbackNetwork>,
    address: Address,
}

impl Driver for LoopbackDriver {
    fn send_packet(&self, destination: Address, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= self.network.max_payload);
        let mut queues = self.network.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&destination) {
            queue.push_back(Packet {
                source: self.address,
                payload: payload.to_vec(),
            });
        }
        // No driver at the destination: the packet vanishes, like on a
        // real datagram network.
        Ok(())
    }

    fn receive_packets(&self, max_packets: usize) -> Vec<Packet> {
        let mut queues = self.network.queues.lock().unwrap();
        let queue = match queues.get_mut(&self.address) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let count = queue.len().min(max_packets);
        queue.drain(..count).collect()
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn max_payload_size(&self) -> usize {
        self.network.max_payload
    }
}
