//! Inbound message reassembly.
//!
//! The receiver collects DATA packets into per-message buffers keyed by
//! message id. Fully reassembled messages move to a ready queue that the
//! transport drains with `receive_message`; partially received ones are
//! driven forward with GRANTs as bytes arrive, re-requested with RESEND
//! when they go quiet, and abandoned once the sender has been silent for
//! the message timeout.
//!
//! PING probes from the sending side are answered with a GRANT when the
//! message is known here (proving liveness) and with UNKNOWN when it is
//! not, which makes the sender start over.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Packet};
use crate::message::InboundMessage;
use crate::protocol::{CommonHeader, DataHeader, GrantHeader, MessageId, Opcode, ResendHeader};
use crate::timing::monotonic_micros;

/// Reassembly state of one partially received message.
struct Partial {
    source: Address,
    total: usize,
    buf: Vec<u8>,
    /// Disjoint, sorted byte ranges received so far.
    received: Vec<(usize, usize)>,
    /// Bytes granted to the sender so far.
    granted: usize,
    last_activity_us: u64,
    last_resend_us: u64,
}

impl Partial {
    fn new(source: Address, total: usize, unscheduled_limit: usize, now: u64) -> Self {
        Self {
            source,
            total,
            buf: vec![0u8; total],
            received: Vec::new(),
            granted: total.min(unscheduled_limit),
            last_activity_us: now,
            last_resend_us: now,
        }
    }

    /// Record `[start, end)` as received, merging adjacent ranges.
    fn insert(&mut self, start: usize, end: usize) {
        let idx = self
            .received
            .iter()
            .position(|&(s, _)| s > start)
            .unwrap_or(self.received.len());
        self.received.insert(idx, (start, end));

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.received.len());
        for &(s, e) in self.received.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.received = merged;
    }

    fn received_bytes(&self) -> usize {
        self.received.iter().map(|&(s, e)| e - s).sum()
    }

    fn is_complete(&self) -> bool {
        self.received == [(0, self.total)]
    }

    /// The first missing byte range.
    fn first_gap(&self) -> (usize, usize) {
        match self.received.first() {
            None => (0, self.total),
            Some(&(0, end)) => {
                let next = self
                    .received
                    .get(1)
                    .map(|&(s, _)| s)
                    .unwrap_or(self.total);
                (end, next - end)
            }
            Some(&(start, _)) => (0, start),
        }
    }
}

struct ReceiverInner {
    partials: HashMap<MessageId, Partial>,
    /// Fully reassembled messages, kept until dropped by the transport.
    assembled: HashMap<MessageId, Arc<InboundMessage>>,
    /// Assembled messages not yet handed to the transport.
    ready: VecDeque<Arc<InboundMessage>>,
}

/// Reassembles inbound messages. Thread-safe.
pub(crate) struct Receiver {
    driver: Arc<dyn Driver>,
    resend_interval_us: u64,
    message_timeout_us: u64,
    unscheduled_limit: usize,
    inner: Mutex<ReceiverInner>,
}

impl Receiver {
    pub(crate) fn new(driver: Arc<dyn Driver>, config: &TransportConfig) -> Self {
        Self {
            driver,
            resend_interval_us: config.resend_interval_us(),
            message_timeout_us: config.message_timeout_us(),
            unscheduled_limit: config.unscheduled_limit,
            inner: Mutex::new(ReceiverInner {
                partials: HashMap::new(),
                assembled: HashMap::new(),
                ready: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn handle_data_packet(&self, packet: &Packet) {
        let header = match DataHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed DATA packet");
                return;
            }
        };
        let id = header.common.message_id();
        let total = header.total_length as usize;
        let offset = header.offset as usize;
        let chunk = &packet.payload[DataHeader::SIZE..];
        if offset + chunk.len() > total {
            warn!(%id, "DATA packet exceeds message bounds");
            return;
        }

        let now = monotonic_micros();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.assembled.contains_key(&id) {
            trace!(%id, "duplicate DATA for assembled message");
            return;
        }

        let partial = inner
            .partials
            .entry(id)
            .or_insert_with(|| Partial::new(packet.source, total, self.unscheduled_limit, now));
        // A peer that changes its mind about the message length mid-flight
        // must not write past the reassembly buffer.
        if offset + chunk.len() > partial.total {
            warn!(%id, "DATA packet disagrees with message length");
            return;
        }
        partial.buf[offset..offset + chunk.len()].copy_from_slice(chunk);
        partial.insert(offset, offset + chunk.len());
        partial.last_activity_us = now;

        if partial.is_complete() {
            let partial = inner.partials.remove(&id).unwrap();
            let message = Arc::new(InboundMessage::new(id, partial.source, partial.buf));
            inner.assembled.insert(id, Arc::clone(&message));
            inner.ready.push_back(message);
        } else {
            let grant = total.min(partial.received_bytes() + self.unscheduled_limit);
            if grant > partial.granted {
                partial.granted = grant;
                let packet = GrantHeader::new(id, grant as u32).to_bytes();
                if let Err(e) = self.driver.send_packet(partial.source, &packet) {
                    warn!(%id, error = %e, "failed to send GRANT packet");
                }
            }
        }
    }

    /// The sender is alive but has nothing for us yet; push the quiet
    /// timers back.
    pub(crate) fn handle_busy_packet(&self, packet: &Packet) {
        let header = match CommonHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed BUSY packet");
                return;
            }
        };
        let id = header.message_id();

        let mut inner = self.inner.lock().unwrap();
        if let Some(partial) = inner.partials.get_mut(&id) {
            let now = monotonic_micros();
            partial.last_activity_us = now;
            partial.last_resend_us = now;
        }
    }

    pub(crate) fn handle_ping_packet(&self, packet: &Packet) {
        let header = match CommonHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed PING packet");
                return;
            }
        };
        let id = header.message_id();

        let inner = self.inner.lock().unwrap();
        let reply = if let Some(partial) = inner.partials.get(&id) {
            GrantHeader::new(id, partial.granted as u32).to_bytes().to_vec()
        } else if let Some(message) = inner.assembled.get(&id) {
            GrantHeader::new(id, message.wire_len() as u32)
                .to_bytes()
                .to_vec()
        } else {
            CommonHeader::new(Opcode::Unknown, id).to_bytes().to_vec()
        };
        if let Err(e) = self.driver.send_packet(packet.source, &reply) {
            warn!(%id, error = %e, "failed to answer PING packet");
        }
    }

    /// Pop the next fully reassembled message, if any.
    pub(crate) fn receive_message(&self) -> Option<Arc<InboundMessage>> {
        self.inner.lock().unwrap().ready.pop_front()
    }

    /// Stop tracking a message. Safe for messages already dropped.
    pub(crate) fn drop_message(&self, message: &Arc<InboundMessage>) {
        self.inner.lock().unwrap().assembled.remove(&message.id());
    }

    /// Send a DONE packet acknowledging an incoming message, addressed to
    /// its original source.
    pub(crate) fn send_done_packet(message: &Arc<InboundMessage>, driver: &dyn Driver) {
        let done = CommonHeader::new(Opcode::Done, message.id()).to_bytes();
        if let Err(e) = driver.send_packet(message.source(), &done) {
            warn!(id = %message.id(), error = %e, "failed to send DONE packet");
        }
    }

    /// Advance timers: re-request quiet gaps, abandon dead partials.
    pub(crate) fn poll(&self) {
        self.poll_at(monotonic_micros());
    }

    pub(crate) fn poll_at(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut abandoned = Vec::new();

        for (&id, partial) in inner.partials.iter_mut() {
            if now.saturating_sub(partial.last_activity_us) >= self.message_timeout_us {
                abandoned.push(id);
                continue;
            }
            if now.saturating_sub(partial.last_activity_us) >= self.resend_interval_us
                && now.saturating_sub(partial.last_resend_us) >= self.resend_interval_us
            {
                let (offset, length) = partial.first_gap();
                let resend = ResendHeader::new(id, offset as u32, length as u32).to_bytes();
                if let Err(e) = self.driver.send_packet(partial.source, &resend) {
                    warn!(%id, error = %e, "failed to send RESEND packet");
                }
                partial.last_resend_us = now;
            }
        }

        for id in abandoned {
            warn!(%id, "inbound message timed out; abandoning");
            inner.partials.remove(&id);
        }
    }
}
