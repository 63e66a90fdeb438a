//! Operation objects.
//!
//! An [`Op`] is one endpoint of a request/response exchange: the client
//! side created by `Transport::alloc_op`, or the server side created by
//! the transport when a request message arrives. Both roles share one type
//! with a branching state machine (driven by the transport's poll loop).
//!
//! `state` and `retained` are atomics so the application can observe them
//! without locking; `destroy` and the attached inbound message are guarded
//! by the per-op mutex. Each op also carries a transport-local `token`
//! used by the transport tables, the update-hint queue and the unused-op
//! queue — a token that no longer resolves against the active table is a
//! stale reference and is ignored.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::{InboundMessage, OutboundMessage};
use crate::protocol::OpId;

/// Observable state of an operation.
///
/// The state only ever advances along
/// NotStarted → InProgress → (Completed | Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    /// Created but not yet active.
    NotStarted = 0,
    /// Request sent (client) or request delivered (server).
    InProgress = 1,
    /// The exchange finished successfully.
    Completed = 2,
    /// The exchange timed out or the peer signalled an error.
    Failed = 3,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OpState::NotStarted,
            1 => OpState::InProgress,
            2 => OpState::Completed,
            _ => OpState::Failed,
        }
    }
}

/// Which side of the exchange an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpRole {
    /// Issues a request and waits for the response.
    Client,
    /// Services an incoming request and may reply or delegate.
    Server,
}

/// State guarded by the per-op mutex.
pub(crate) struct OpInner {
    /// Set once the op has been queued for reclamation.
    pub(crate) destroy: bool,
    /// The request (server role) or response (client role), once attached.
    pub(crate) in_message: Option<Arc<InboundMessage>>,
}

/// One client or server endpoint of a request/response exchange.
pub struct Op {
    token: u64,
    op_id: OpId,
    role: OpRole,
    state: AtomicU8,
    retained: AtomicBool,
    out_message: Arc<OutboundMessage>,
    pub(crate) inner: Mutex<OpInner>,
}

impl Op {
    pub(crate) fn new(token: u64, op_id: OpId, role: OpRole) -> Arc<Self> {
        Arc::new(Self {
            token,
            op_id,
            role,
            state: AtomicU8::new(OpState::NotStarted as u8),
            retained: AtomicBool::new(false),
            out_message: Arc::new(OutboundMessage::new(token)),
            inner: Mutex::new(OpInner {
                destroy: false,
                in_message: None,
            }),
        })
    }

    /// Current state. Safe to read from any thread without locking.
    #[inline]
    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: OpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The role this op was created with.
    #[inline]
    pub fn role(&self) -> OpRole {
        self.role
    }

    /// The globally unique id of this operation.
    #[inline]
    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn retained(&self) -> bool {
        self.retained.load(Ordering::Acquire)
    }

    pub(crate) fn set_retained(&self, retained: bool) {
        self.retained.store(retained, Ordering::Release);
    }

    /// The outbound message of this op (request for clients, reply or
    /// delegated request for servers).
    pub fn out_message(&self) -> &Arc<OutboundMessage> {
        &self.out_message
    }

    /// Append bytes to the outbound payload. Call before `send_request` /
    /// `send_reply`.
    pub fn append_payload(&self, data: &[u8]) {
        self.out_message.append(data);
    }

    /// Copy of the inbound payload: the request for a server op, the
    /// response for a client op. `None` until a ready message is attached.
    pub fn payload(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .in_message
            .as_ref()
            .filter(|m| m.is_ready())
            .map(|m| m.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_op_defaults() {
        let op = Op::new(1, OpId::new(10, 1), OpRole::Client);
        assert_eq!(op.state(), OpState::NotStarted);
        assert_eq!(op.role(), OpRole::Client);
        assert!(!op.retained());
        assert!(op.payload().is_none());
    }

    #[test]
    fn state_readable_without_lock() {
        let op = Op::new(1, OpId::new(10, 1), OpRole::Server);
        let _held = op.inner.lock().unwrap();
        // Atomic state stays observable while the op mutex is held.
        assert_eq!(op.state(), OpState::NotStarted);
        op.set_state(OpState::InProgress);
        assert_eq!(op.state(), OpState::InProgress);
    }
}
