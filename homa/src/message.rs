//! Inbound and outbound message handles.
//!
//! A message buffer is shared between an operation (which owns it for its
//! lifetime) and the sender or receiver working on it. The message state is
//! atomic so the transport's state machine can observe it without taking
//! the buffer lock.
//!
//! Both buffer kinds start with a [`MessageHeader`] prefix ahead of the
//! application payload. The outbound header is populated when the owning
//! operation is handed to the application; the inbound header is parsed
//! from the wire bytes and stripped (skipped, not removed) once the
//! message is ready.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::driver::Address;
use crate::protocol::{MessageHeader, MessageId, RAW_ADDRESS_SIZE};

/// State of an outbound message, written by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutboundState {
    /// Transmission has not been requested yet.
    NotStarted = 0,
    /// Some bytes remain to be transmitted.
    InProgress = 1,
    /// Every byte has been transmitted at least once.
    Sent = 2,
    /// The remote endpoint acknowledged the message.
    Completed = 3,
    /// The message timed out or the remote endpoint signalled an error.
    Failed = 4,
}

impl OutboundState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OutboundState::NotStarted,
            1 => OutboundState::InProgress,
            2 => OutboundState::Sent,
            3 => OutboundState::Completed,
            _ => OutboundState::Failed,
        }
    }
}

struct OutboundInner {
    /// Wire id, assigned when transmission is requested.
    id: Option<MessageId>,
    /// Message header followed by application payload.
    buf: Vec<u8>,
}

/// An outbound message owned by one operation and transmitted by the
/// sender.
pub struct OutboundMessage {
    /// Token of the owning operation, for update hints.
    op_token: u64,
    state: AtomicU8,
    inner: Mutex<OutboundInner>,
}

impl OutboundMessage {
    pub(crate) fn new(op_token: u64) -> Self {
        Self {
            op_token,
            state: AtomicU8::new(OutboundState::NotStarted as u8),
            inner: Mutex::new(OutboundInner {
                id: None,
                buf: vec![0u8; MessageHeader::SIZE],
            }),
        }
    }

    /// Current transmission state.
    #[inline]
    pub fn state(&self) -> OutboundState {
        OutboundState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: OutboundState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn op_token(&self) -> u64 {
        self.op_token
    }

    /// Wire id of the message, once transmission has been requested.
    pub fn id(&self) -> Option<MessageId> {
        self.inner.lock().unwrap().id
    }

    pub(crate) fn set_id(&self, id: MessageId) {
        self.inner.lock().unwrap().id = Some(id);
    }

    /// Append application payload bytes.
    pub fn append(&self, data: &[u8]) {
        self.inner.lock().unwrap().buf.extend_from_slice(data);
    }

    /// Application payload length in bytes (excludes the message header).
    pub fn payload_len(&self) -> usize {
        self.inner.lock().unwrap().buf.len() - MessageHeader::SIZE
    }

    /// Total wire length in bytes (includes the message header).
    pub(crate) fn wire_len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub(crate) fn set_reply_address(&self, raw: [u8; RAW_ADDRESS_SIZE]) {
        let mut inner = self.inner.lock().unwrap();
        inner.buf[..MessageHeader::SIZE].copy_from_slice(&MessageHeader::new(raw).to_bytes());
    }

    /// Copy of the full wire buffer, taken by the sender at transmission
    /// time; later application writes do not affect an in-flight message.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().buf.clone()
    }
}

/// An inbound message assembled by the receiver and attached to one
/// operation.
pub struct InboundMessage {
    id: MessageId,
    source: Address,
    ready: AtomicBool,
    /// Offset of the application payload within `buf`; advanced past the
    /// message header when the message is stripped.
    start: AtomicUsize,
    buf: Mutex<Vec<u8>>,
}

impl InboundMessage {
    pub(crate) fn new(id: MessageId, source: Address, buf: Vec<u8>) -> Self {
        Self {
            id,
            source,
            ready: AtomicBool::new(true),
            start: AtomicUsize::new(0),
            buf: Mutex::new(buf),
        }
    }

    /// Wire id of the message.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Address the message was received from.
    pub(crate) fn source(&self) -> Address {
        self.source
    }

    /// True once the message has been fully reassembled.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Parse the message header from the front of the buffer.
    pub(crate) fn header(&self) -> MessageHeader {
        let buf = self.buf.lock().unwrap();
        MessageHeader::from_bytes(&buf).expect("inbound message shorter than its header")
    }

    /// Skip the message header so `payload` returns application bytes only.
    pub(crate) fn strip_header(&self) {
        self.start.store(MessageHeader::SIZE, Ordering::Release);
    }

    /// Copy of the application-visible payload.
    pub fn payload(&self) -> Vec<u8> {
        let buf = self.buf.lock().unwrap();
        buf[self.start.load(Ordering::Acquire)..].to_vec()
    }

    /// Total wire length in bytes, independent of header stripping.
    pub(crate) fn wire_len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpId;

    #[test]
    fn outbound_append_and_len() {
        let message = OutboundMessage::new(1);
        assert_eq!(message.payload_len(), 0);
        assert_eq!(message.wire_len(), MessageHeader::SIZE);

        message.append(b"abc");
        message.append(b"def");
        assert_eq!(message.payload_len(), 6);
        assert_eq!(message.wire_len(), MessageHeader::SIZE + 6);
    }

    #[test]
    fn outbound_reply_address_in_snapshot() {
        let message = OutboundMessage::new(1);
        message.append(b"payload");
        message.set_reply_address([7; RAW_ADDRESS_SIZE]);

        let snapshot = message.snapshot();
        let header = MessageHeader::from_bytes(&snapshot).unwrap();
        assert_eq!(header.reply_address, [7; RAW_ADDRESS_SIZE]);
        assert_eq!(&snapshot[MessageHeader::SIZE..], b"payload");
    }

    #[test]
    fn outbound_state_transitions_visible() {
        let message = OutboundMessage::new(1);
        assert_eq!(message.state(), OutboundState::NotStarted);
        message.set_state(OutboundState::InProgress);
        message.set_state(OutboundState::Sent);
        assert_eq!(message.state(), OutboundState::Sent);
    }

    #[test]
    fn inbound_strip_header() {
        let id = MessageId::new(OpId::new(1, 1), 1);
        let source = Address::from_raw([0; RAW_ADDRESS_SIZE]);
        let mut buf = MessageHeader::new([3; RAW_ADDRESS_SIZE]).to_bytes().to_vec();
        buf.extend_from_slice(b"request");

        let message = InboundMessage::new(id, source, buf);
        assert!(message.is_ready());
        assert_eq!(message.payload().len(), MessageHeader::SIZE + 7);

        message.strip_header();
        assert_eq!(message.payload(), b"request");
        // The header stays parseable after stripping.
        assert_eq!(message.header().reply_address, [3; RAW_ADDRESS_SIZE]);
    }
}
