//! The transport coordinator.
//!
//! Binds inbound and outbound messages into operations, routes received
//! packets to the sender and receiver by opcode, runs the per-op state
//! machine, and garbage-collects operations the application has released.
//!
//! There is no internal thread: the application drives progress by calling
//! [`Transport::poll`], typically from one dedicated thread, while the
//! other API calls may arrive from any thread.
//!
//! # Lock hierarchy
//!
//! From outermost to innermost: the op-table mutex, then a single op's
//! mutex, then the leaf locks (hint queue, pending-server queue, unused-op
//! queue, sender/receiver tables, message buffers). No code path acquires
//! an outer lock while holding an inner one, and two op mutexes are never
//! held at once. Paths that find an op through a table use lock hand-off:
//! take the table lock, locate the op, take the op lock, release the table
//! lock, continue under the op lock alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::driver::{Address, Driver};
use crate::error::{Error, Result};
use crate::message::OutboundState;
use crate::op::{Op, OpInner, OpRole, OpState};
use crate::protocol::{
    CommonHeader, DataHeader, MessageId, OpId, Opcode, INITIAL_REQUEST_TAG,
    ULTIMATE_RESPONSE_TAG,
};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Deduplicated FIFO of op tokens that may need their state machine
/// re-evaluated.
///
/// Posting is idempotent: an op already queued is not queued again, so any
/// number of concurrent events produce at most one outstanding
/// notification per op.
pub(crate) struct UpdateHints {
    inner: Mutex<HintState>,
}

struct HintState {
    order: VecDeque<u64>,
    members: HashSet<u64>,
}

impl UpdateHints {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HintState {
                order: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    /// Queue a hint for `token`; duplicates are ignored.
    pub(crate) fn post(&self, token: u64) {
        let mut state = self.inner.lock().unwrap();
        if state.members.insert(token) {
            state.order.push_back(token);
        }
    }

    /// Pop the oldest hint.
    pub(crate) fn take(&self) -> Option<u64> {
        let mut state = self.inner.lock().unwrap();
        let token = state.order.pop_front()?;
        state.members.remove(&token);
        Some(token)
    }

    /// Number of queued hints.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

/// Transport-wide op indices, guarded by one mutex.
struct OpTable {
    /// Every live op, keyed by its transport-local token.
    active: HashMap<u64, Arc<Op>>,
    /// Client ops waiting for a response, keyed by op id.
    remote: HashMap<OpId, Arc<Op>>,
    next_sequence: u64,
    next_token: u64,
}

impl OpTable {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            remote: HashMap::new(),
            next_sequence: 1,
            next_token: 1,
        }
    }

    fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }
}

/// A Homa transport endpoint.
///
/// All API calls are thread-safe with respect to each other; concurrent
/// use of a single [`Op`] from multiple threads is not supported and must
/// be serialized by the application.
pub struct Transport {
    driver: Arc<dyn Driver>,
    transport_id: u64,
    max_burst: usize,
    sender: Sender,
    receiver: Receiver,
    hints: Arc<UpdateHints>,
    table: Mutex<OpTable>,
    /// Server ops whose request is ready for the application.
    pending_server_ops: Mutex<VecDeque<Arc<Op>>>,
    /// Tokens of ops awaiting destruction by the next reap pass.
    unused_ops: Mutex<VecDeque<u64>>,
}

impl Transport {
    /// Create a transport on top of `driver`.
    ///
    /// `transport_id` must be unique among the transports that will
    /// communicate with each other.
    pub fn new(
        driver: Arc<dyn Driver>,
        transport_id: u64,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        // The sender must fit a DATA header and at least one payload byte
        // in every packet.
        if driver.max_payload_size() <= DataHeader::SIZE {
            return Err(Error::InvalidConfig(format!(
                "driver max_payload_size {} cannot carry a DATA packet (header is {} bytes)",
                driver.max_payload_size(),
                DataHeader::SIZE,
            )));
        }
        let hints = Arc::new(UpdateHints::new());
        Ok(Self {
            sender: Sender::new(Arc::clone(&driver), Arc::clone(&hints), &config),
            receiver: Receiver::new(Arc::clone(&driver), &config),
            driver,
            transport_id,
            max_burst: config.max_burst,
            hints,
            table: Mutex::new(OpTable::new()),
            pending_server_ops: Mutex::new(VecDeque::new()),
            unused_ops: Mutex::new(VecDeque::new()),
        })
    }

    /// The address peers should send requests to.
    pub fn local_address(&self) -> Address {
        self.driver.local_address()
    }

    /// Number of live ops (client and server).
    pub fn active_ops(&self) -> usize {
        self.table.lock().unwrap().active.len()
    }

    /// Allocate a new client op.
    ///
    /// The caller fills the outbound payload, calls [`send_request`], and
    /// watches [`Op::state`] for completion.
    ///
    /// [`send_request`]: Transport::send_request
    pub fn alloc_op(&self) -> Arc<Op> {
        let op = {
            let mut table = self.table.lock().unwrap();
            let op_id = OpId::new(self.transport_id, table.next_sequence);
            table.next_sequence += 1;
            let token = table.next_token();
            let op = Op::new(token, op_id, OpRole::Client);
            table.active.insert(token, Arc::clone(&op));
            table.remote.insert(op_id, Arc::clone(&op));
            op
        };
        op.out_message()
            .set_reply_address(self.driver.local_address().to_raw());
        op.set_retained(true);
        op
    }

    /// Return the next server op whose request is ready, if any.
    pub fn receive_op(&self) -> Option<Arc<Op>> {
        loop {
            let op = self.pending_server_ops.lock().unwrap().pop_front()?;
            let inner = op.inner.lock().unwrap();
            if inner.destroy {
                continue;
            }
            let request = inner
                .in_message
                .as_ref()
                .expect("pending server op without a request");
            // Replies (and delegated requests) inherit the reply address
            // of the incoming request.
            op.out_message()
                .set_reply_address(request.header().reply_address);
            drop(inner);
            op.set_retained(true);
            return Some(op);
        }
    }

    /// Signal that the application no longer needs `op`.
    ///
    /// Reclamation is deferred to a later poll; calling this twice is
    /// harmless.
    pub fn release_op(&self, op: &Arc<Op>) {
        op.set_retained(false);
        self.hints.post(op.token());
    }

    /// Transmit the outbound payload of `op` as a request to
    /// `destination`.
    ///
    /// For a client op this starts the exchange. For a server op it issues
    /// a delegated request on behalf of the incoming one, continuing the
    /// operation chain.
    pub fn send_request(&self, op: &Arc<Op>, destination: Address) -> Result<()> {
        self.check_message_size(op)?;
        let inner = op.inner.lock().unwrap();
        match op.role() {
            OpRole::Server => {
                let request_id = inner
                    .in_message
                    .as_ref()
                    .expect("delegating server op without a request")
                    .id();
                let delegated = MessageId::new(request_id.op_id, request_id.tag + 1);
                self.sender
                    .send_message(delegated, destination, op.out_message());
            }
            OpRole::Client => {
                op.set_state(OpState::InProgress);
                let id = MessageId::new(op.op_id(), INITIAL_REQUEST_TAG);
                self.sender.send_message(id, destination, op.out_message());
            }
        }
        Ok(())
    }

    /// Transmit the outbound payload of `op` as the ultimate reply,
    /// addressed to the requesting client.
    pub fn send_reply(&self, op: &Arc<Op>) -> Result<()> {
        assert_eq!(op.role(), OpRole::Server, "send_reply requires a server op");
        self.check_message_size(op)?;
        let inner = op.inner.lock().unwrap();
        let request = inner
            .in_message
            .as_ref()
            .expect("replying server op without a request");
        let reply_address = Address::from_raw(request.header().reply_address);
        let id = MessageId::new(request.id().op_id, ULTIMATE_RESPONSE_TAG);
        op.set_state(OpState::InProgress);
        self.sender
            .send_message(id, reply_address, op.out_message());
        Ok(())
    }

    fn check_message_size(&self, op: &Arc<Op>) -> Result<()> {
        let size = op.out_message().wire_len();
        if size > u32::MAX as usize {
            return Err(Error::MessageTooLarge {
                size,
                max: u32::MAX as usize,
            });
        }
        Ok(())
    }

    /// Make incremental progress on everything.
    ///
    /// One pass receives and routes a burst of packets, lets the sender
    /// and receiver run their timers, binds newly assembled messages to
    /// ops, re-evaluates hinted ops, and reaps released ones. Must be
    /// called repeatedly.
    pub fn poll(&self) {
        self.process_packets();
        self.sender.poll();
        self.receiver.poll();
        self.process_inbound_messages();
        self.check_for_updates();
        self.cleanup_ops();
    }

    /// Receive a burst of packets and route each by opcode.
    fn process_packets(&self) {
        let packets = self.driver.receive_packets(self.max_burst);
        for packet in &packets {
            debug_assert!(packet.len() >= CommonHeader::SIZE, "runt packet");
            let opcode = match CommonHeader::from_bytes(&packet.payload).and_then(|h| h.opcode()) {
                Ok(opcode) => opcode,
                Err(e) => {
                    warn!(error = %e, "dropping unroutable packet");
                    continue;
                }
            };
            match opcode {
                Opcode::Data => self.receiver.handle_data_packet(packet),
                Opcode::Grant => self.sender.handle_grant_packet(packet),
                Opcode::Done => self.sender.handle_done_packet(packet),
                Opcode::Resend => self.sender.handle_resend_packet(packet),
                Opcode::Busy => self.receiver.handle_busy_packet(packet),
                Opcode::Ping => self.receiver.handle_ping_packet(packet),
                Opcode::Unknown => self.sender.handle_unknown_packet(packet),
                Opcode::Error => self.sender.handle_error_packet(packet),
            }
        }
    }

    /// Bind newly assembled inbound messages to ops.
    ///
    /// Responses attach to the client op waiting on their id (or are
    /// dropped if none is — the client already released). Requests create
    /// a fresh server op.
    fn process_inbound_messages(&self) {
        while let Some(message) = self.receiver.receive_message() {
            let id = message.id();
            if message.wire_len() < crate::protocol::MessageHeader::SIZE {
                warn!(%id, "message shorter than its header; dropping");
                self.receiver.drop_message(&message);
                continue;
            }
            if id.tag == ULTIMATE_RESPONSE_TAG {
                let table = self.table.lock().unwrap();
                match table.remote.get(&id.op_id).cloned() {
                    Some(op) => {
                        // Lock hand-off.
                        let mut inner = op.inner.lock().unwrap();
                        drop(table);
                        inner.in_message = Some(message);
                        self.hints.post(op.token());
                    }
                    None => {
                        drop(table);
                        debug!(%id, "response for unknown op; dropping");
                        self.receiver.drop_message(&message);
                    }
                }
            } else {
                let mut table = self.table.lock().unwrap();
                let token = table.next_token();
                let op = Op::new(token, id.op_id, OpRole::Server);
                table.active.insert(token, Arc::clone(&op));

                // Lock hand-off.
                let mut inner = op.inner.lock().unwrap();
                drop(table);
                inner.in_message = Some(message);
                self.hints.post(token);
            }
        }
    }

    /// Re-run the state machine for hinted ops.
    ///
    /// Consumes at most the number of hints present at entry, so hints
    /// posted during the pass are deferred to the next one.
    fn check_for_updates(&self) {
        let limit = self.hints.len();
        for _ in 0..limit {
            let token = match self.hints.take() {
                Some(token) => token,
                None => break,
            };

            let table = self.table.lock().unwrap();
            let op = match table.active.get(&token).cloned() {
                Some(op) => op,
                // Stale hint: the op was reaped after the hint was posted.
                None => continue,
            };

            // Lock hand-off.
            let mut inner = op.inner.lock().unwrap();
            drop(table);
            self.process_updates(&op, &mut inner);
        }
    }

    /// The op state machine. Called with the op's lock held.
    fn process_updates(&self, op: &Arc<Op>, inner: &mut OpInner) {
        if inner.destroy {
            return;
        }

        let state = op.state();
        let out_state = op.out_message().state();

        match op.role() {
            OpRole::Server => match state {
                OpState::NotStarted => {
                    let request = inner
                        .in_message
                        .as_ref()
                        .expect("server op without a request");
                    if request.is_ready() {
                        request.strip_header();
                        self.pending_server_ops
                            .lock()
                            .unwrap()
                            .push_back(Arc::clone(op));
                        op.set_state(OpState::InProgress);
                    }
                }
                OpState::InProgress => {
                    let out_tag = op.out_message().id().map(|id| id.tag);
                    if out_state == OutboundState::Completed
                        || (out_tag == Some(ULTIMATE_RESPONSE_TAG)
                            && out_state == OutboundState::Sent)
                    {
                        op.set_state(OpState::Completed);
                        if let Some(request) = &inner.in_message {
                            // A delegated (middle-hop) request is
                            // acknowledged explicitly; for an initial
                            // request the reply itself is the ack.
                            if request.id().tag != INITIAL_REQUEST_TAG {
                                Receiver::send_done_packet(request, &*self.driver);
                            }
                        }
                        self.hints.post(op.token());
                    } else if out_state == OutboundState::Failed {
                        op.set_state(OpState::Failed);
                        self.hints.post(op.token());
                    }
                }
                OpState::Completed | OpState::Failed => {
                    if !op.retained() {
                        self.drop_op(op, inner);
                    }
                }
            },
            OpRole::Client => {
                if !op.retained() {
                    // The client lost interest; whatever state the op is
                    // in, it can go.
                    self.drop_op(op, inner);
                    return;
                }
                match state {
                    OpState::NotStarted => {}
                    OpState::InProgress => {
                        let response_ready = inner
                            .in_message
                            .as_ref()
                            .map(|m| m.is_ready())
                            .unwrap_or(false);
                        if response_ready {
                            let response = inner.in_message.as_ref().unwrap();
                            response.strip_header();
                            op.set_state(OpState::Completed);
                            self.hints.post(op.token());
                        } else if out_state == OutboundState::Failed {
                            op.set_state(OpState::Failed);
                            self.hints.post(op.token());
                        }
                    }
                    OpState::Completed | OpState::Failed => {}
                }
            }
        }
    }

    /// Mark `op` reclaimable. Called with the op's lock held; the actual
    /// destruction happens in `cleanup_ops` under the table lock.
    fn drop_op(&self, op: &Arc<Op>, inner: &mut OpInner) {
        if inner.destroy {
            return;
        }
        inner.destroy = true;
        self.unused_ops.lock().unwrap().push_back(op.token());
        trace!(op_id = %op.op_id(), "op queued for reclamation");
    }

    /// Destroy ops queued for reclamation.
    ///
    /// Consumes at most the queue length observed at entry.
    fn cleanup_ops(&self) {
        let limit = self.unused_ops.lock().unwrap().len();
        for _ in 0..limit {
            let token = match self.unused_ops.lock().unwrap().pop_front() {
                Some(token) => token,
                None => break,
            };

            let mut table = self.table.lock().unwrap();
            let op = match table.active.get(&token).cloned() {
                Some(op) => op,
                None => continue,
            };

            let in_message = {
                let inner = op.inner.lock().unwrap();
                debug_assert!(inner.destroy);
                inner.in_message.clone()
            };

            self.sender.drop_message(op.out_message());
            if let Some(message) = in_message {
                self.receiver.drop_message(&message);
            }
            if op.role() == OpRole::Client {
                table.remote.remove(&op.op_id());
            }
            table.active.remove(&token);
        }
    }
}
