//! Outbound message transmission.
//!
//! The sender packetizes outbound messages into DATA packets and walks
//! them through the outbound state machine: InProgress while bytes remain,
//! Sent once every byte has been transmitted, Completed when the remote
//! endpoint acknowledges with DONE, Failed on ERROR or timeout.
//!
//! Transmission is grant-paced: up to `unscheduled_limit` bytes go out
//! immediately, the rest waits for GRANT packets from the receiving side.
//! Grants only ever move forward; stale and over-long grants are ignored
//! or clamped. Quiet messages are pinged for liveness and failed once the
//! peer has been silent for the message timeout.
//!
//! Every outbound state change posts an update hint for the owning op so
//! the transport re-runs its state machine on the next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Packet};
use crate::message::{OutboundMessage, OutboundState};
use crate::protocol::{CommonHeader, DataHeader, GrantHeader, MessageId, Opcode, ResendHeader};
use crate::timing::monotonic_micros;
use crate::transport::UpdateHints;

/// Per-message transmission bookkeeping.
struct SendEntry {
    message: Arc<OutboundMessage>,
    destination: Address,
    /// Snapshot of the wire bytes taken when transmission was requested.
    buf: Vec<u8>,
    /// Bytes the receiver has granted so far.
    granted: usize,
    /// Transmission frontier: bytes below this offset have been sent.
    sent: usize,
    /// Last time the peer showed signs of life for this message.
    last_activity_us: u64,
    last_ping_us: u64,
}

/// Transmits outbound messages reliably. Thread-safe.
pub(crate) struct Sender {
    driver: Arc<dyn Driver>,
    hints: Arc<UpdateHints>,
    message_timeout_us: u64,
    ping_interval_us: u64,
    unscheduled_limit: usize,
    messages: Mutex<HashMap<MessageId, SendEntry>>,
}

impl Sender {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        hints: Arc<UpdateHints>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            driver,
            hints,
            message_timeout_us: config.message_timeout_us(),
            ping_interval_us: config.ping_interval_us(),
            unscheduled_limit: config.unscheduled_limit,
            messages: Mutex::new(HashMap::new()),
        }
    }

    /// Payload bytes that fit in one DATA packet.
    ///
    /// `Transport::new` rejects drivers whose payload limit cannot carry
    /// a DATA header, so this never returns zero.
    #[inline]
    fn chunk_capacity(&self) -> usize {
        let max = self.driver.max_payload_size();
        debug_assert!(max > DataHeader::SIZE, "driver MTU below DATA header size");
        max.saturating_sub(DataHeader::SIZE)
    }

    /// Begin transmitting `message` under `id`.
    ///
    /// A second request for an id already in flight is dropped.
    pub(crate) fn send_message(
        &self,
        id: MessageId,
        destination: Address,
        message: &Arc<OutboundMessage>,
    ) {
        let mut messages = self.messages.lock().unwrap();
        if messages.contains_key(&id) {
            warn!(%id, "duplicate send for in-flight message; dropped");
            return;
        }

        let buf = message.snapshot();
        message.set_id(id);
        message.set_state(OutboundState::InProgress);

        let now = monotonic_micros();
        let mut entry = SendEntry {
            message: Arc::clone(message),
            destination,
            granted: buf.len().min(self.unscheduled_limit),
            sent: 0,
            buf,
            last_activity_us: now,
            last_ping_us: now,
        };
        self.transmit(&mut entry, id);
        messages.insert(id, entry);
    }

    /// Send bytes between the frontier and the grant limit.
    fn transmit(&self, entry: &mut SendEntry, id: MessageId) {
        let capacity = self.chunk_capacity();
        if capacity == 0 {
            return;
        }
        while entry.sent < entry.granted {
            let chunk = capacity.min(entry.granted - entry.sent);
            let header = DataHeader::new(id, entry.buf.len() as u32, entry.sent as u32);
            let mut packet = Vec::with_capacity(DataHeader::SIZE + chunk);
            packet.extend_from_slice(&header.to_bytes());
            packet.extend_from_slice(&entry.buf[entry.sent..entry.sent + chunk]);
            if let Err(e) = self.driver.send_packet(entry.destination, &packet) {
                warn!(%id, error = %e, "failed to send DATA packet");
                return;
            }
            entry.sent += chunk;
        }

        if entry.sent == entry.buf.len() && entry.message.state() == OutboundState::InProgress {
            entry.message.set_state(OutboundState::Sent);
            self.hints.post(entry.message.op_token());
        }
    }

    /// Retransmit already-sent bytes overlapping `[offset, offset+length)`.
    fn retransmit_range(&self, entry: &SendEntry, id: MessageId, offset: usize, length: usize) {
        let capacity = self.chunk_capacity();
        if capacity == 0 {
            return;
        }
        let end = (offset + length).min(entry.sent);
        let mut pos = offset;
        while pos < end {
            let chunk = capacity.min(end - pos);
            let header = DataHeader::new(id, entry.buf.len() as u32, pos as u32);
            let mut packet = Vec::with_capacity(DataHeader::SIZE + chunk);
            packet.extend_from_slice(&header.to_bytes());
            packet.extend_from_slice(&entry.buf[pos..pos + chunk]);
            if let Err(e) = self.driver.send_packet(entry.destination, &packet) {
                warn!(%id, error = %e, "failed to resend DATA packet");
                return;
            }
            pos += chunk;
        }
    }

    pub(crate) fn handle_grant_packet(&self, packet: &Packet) {
        let header = match GrantHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed GRANT packet");
                return;
            }
        };
        let id = header.common.message_id();
        let offset = header.offset as usize;

        let mut messages = self.messages.lock().unwrap();
        let entry = match messages.get_mut(&id) {
            Some(entry) => entry,
            None => {
                trace!(%id, "GRANT for unknown message");
                return;
            }
        };
        // Even a stale grant proves the peer is alive.
        entry.last_activity_us = monotonic_micros();
        if offset > entry.granted {
            entry.granted = offset.min(entry.buf.len());
            self.transmit(entry, id);
        }
    }

    pub(crate) fn handle_done_packet(&self, packet: &Packet) {
        let header = match CommonHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed DONE packet");
                return;
            }
        };
        let id = header.message_id();

        let mut messages = self.messages.lock().unwrap();
        if let Some(entry) = messages.remove(&id) {
            match entry.message.state() {
                OutboundState::InProgress | OutboundState::Sent => {
                    entry.message.set_state(OutboundState::Completed);
                    self.hints.post(entry.message.op_token());
                }
                _ => {}
            }
        }
    }

    pub(crate) fn handle_resend_packet(&self, packet: &Packet) {
        let header = match ResendHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed RESEND packet");
                return;
            }
        };
        let id = header.common.message_id();
        let offset = header.offset as usize;
        let length = header.length as usize;

        let mut messages = self.messages.lock().unwrap();
        match messages.get_mut(&id) {
            Some(entry) => {
                entry.last_activity_us = monotonic_micros();
                if offset < entry.sent {
                    self.retransmit_range(entry, id, offset, length);
                } else {
                    // The peer is asking for bytes that were never sent;
                    // tell it to hold on.
                    let busy = CommonHeader::new(Opcode::Busy, id).to_bytes();
                    if let Err(e) = self.driver.send_packet(packet.source, &busy) {
                        warn!(%id, error = %e, "failed to send BUSY packet");
                    }
                }
            }
            None => {
                let unknown = CommonHeader::new(Opcode::Unknown, id).to_bytes();
                if let Err(e) = self.driver.send_packet(packet.source, &unknown) {
                    warn!(%id, error = %e, "failed to send UNKNOWN packet");
                }
            }
        }
    }

    /// The peer does not know a message we believe is in flight; start
    /// over from the first byte.
    pub(crate) fn handle_unknown_packet(&self, packet: &Packet) {
        let header = match CommonHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed UNKNOWN packet");
                return;
            }
        };
        let id = header.message_id();

        let mut messages = self.messages.lock().unwrap();
        if let Some(entry) = messages.get_mut(&id) {
            match entry.message.state() {
                OutboundState::Completed | OutboundState::Failed => {}
                _ => {
                    debug!(%id, "peer lost message; restarting transmission");
                    entry.sent = 0;
                    entry.granted = entry.buf.len().min(self.unscheduled_limit);
                    if entry.message.state() == OutboundState::Sent {
                        entry.message.set_state(OutboundState::InProgress);
                    }
                    entry.last_activity_us = monotonic_micros();
                    self.transmit(entry, id);
                }
            }
        }
    }

    pub(crate) fn handle_error_packet(&self, packet: &Packet) {
        let header = match CommonHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "malformed ERROR packet");
                return;
            }
        };
        let id = header.message_id();

        let mut messages = self.messages.lock().unwrap();
        if let Some(entry) = messages.remove(&id) {
            if entry.message.state() != OutboundState::Completed {
                warn!(%id, "peer signalled error for outbound message");
                entry.message.set_state(OutboundState::Failed);
                self.hints.post(entry.message.op_token());
            }
        }
    }

    /// Stop tracking a message. Safe to call after completion or for a
    /// message that was never sent.
    pub(crate) fn drop_message(&self, message: &Arc<OutboundMessage>) {
        if let Some(id) = message.id() {
            self.messages.lock().unwrap().remove(&id);
        }
    }

    /// Advance timers: retry stalled transmissions, ping quiet messages,
    /// fail dead ones.
    pub(crate) fn poll(&self) {
        self.poll_at(monotonic_micros());
    }

    pub(crate) fn poll_at(&self, now: u64) {
        let mut messages = self.messages.lock().unwrap();
        let mut timed_out = Vec::new();

        for (&id, entry) in messages.iter_mut() {
            if entry.sent < entry.granted {
                self.transmit(entry, id);
            }
            if now.saturating_sub(entry.last_activity_us) >= self.message_timeout_us {
                timed_out.push(id);
                continue;
            }
            if now.saturating_sub(entry.last_activity_us) >= self.ping_interval_us
                && now.saturating_sub(entry.last_ping_us) >= self.ping_interval_us
            {
                let ping = CommonHeader::new(Opcode::Ping, id).to_bytes();
                if let Err(e) = self.driver.send_packet(entry.destination, &ping) {
                    warn!(%id, error = %e, "failed to send PING packet");
                }
                entry.last_ping_us = now;
            }
        }

        for id in timed_out {
            if let Some(entry) = messages.remove(&id) {
                warn!(%id, "outbound message timed out");
                entry.message.set_state(OutboundState::Failed);
                self.hints.post(entry.message.op_token());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LoopbackNetwork;
    use crate::protocol::{MessageHeader, OpId};

    fn setup() -> (Sender, Arc<UpdateHints>, crate::driver::LoopbackDriver, Arc<dyn Driver>) {
        let network = LoopbackNetwork::new();
        let local: Arc<dyn Driver> = Arc::new(network.new_driver());
        let remote = network.new_driver();
        let hints = Arc::new(UpdateHints::new());
        let sender = Sender::new(
            Arc::clone(&local),
            Arc::clone(&hints),
            &TransportConfig::default(),
        );
        (sender, hints, remote, local)
    }

    fn message_with_payload(token: u64, len: usize) -> Arc<OutboundMessage> {
        let message = Arc::new(OutboundMessage::new(token));
        message.append(&vec![0xAB; len]);
        message
    }

    fn id(sequence: u64, tag: u32) -> MessageId {
        MessageId::new(OpId::new(1, sequence), tag)
    }

    #[test]
    fn small_message_sent_in_one_packet() {
        let (sender, hints, remote, _local) = setup();
        let message = message_with_payload(7, 100);

        sender.send_message(id(1, 1), remote.local_address(), &message);

        assert_eq!(message.state(), OutboundState::Sent);
        assert_eq!(hints.take(), Some(7));

        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        let header = DataHeader::from_bytes(&packets[0].payload).unwrap();
        assert_eq!(header.common.message_id(), id(1, 1));
        let total = header.total_length as usize;
        assert_eq!(total, MessageHeader::SIZE + 100);
        assert_eq!(packets[0].payload.len(), DataHeader::SIZE + total);
    }

    #[test]
    fn large_message_stops_at_unscheduled_limit() {
        let (sender, _hints, remote, _local) = setup();
        let limit = TransportConfig::default().unscheduled_limit;
        let message = message_with_payload(7, 4 * limit);

        sender.send_message(id(1, 1), remote.local_address(), &message);

        assert_eq!(message.state(), OutboundState::InProgress);
        let packets = remote.receive_packets(1024);
        let sent: usize = packets
            .iter()
            .map(|p| p.payload.len() - DataHeader::SIZE)
            .sum();
        assert_eq!(sent, limit);
    }

    #[test]
    fn grant_extends_transmission_and_ignores_stale() {
        let (sender, _hints, remote, _local) = setup();
        let limit = TransportConfig::default().unscheduled_limit;
        let total = 4 * limit;
        let message = message_with_payload(7, total);
        let wire_len = MessageHeader::SIZE + total;

        sender.send_message(id(1, 1), remote.local_address(), &message);
        remote.receive_packets(1024);

        // Stale grant below the current limit: nothing new goes out.
        let stale = GrantHeader::new(id(1, 1), (limit / 2) as u32).to_bytes();
        sender.handle_grant_packet(&Packet {
            source: remote.local_address(),
            payload: stale.to_vec(),
        });
        assert!(remote.receive_packets(1024).is_empty());

        // A grant beyond the message length is clamped and finishes it.
        let excess = GrantHeader::new(id(1, 1), (wire_len * 2) as u32).to_bytes();
        sender.handle_grant_packet(&Packet {
            source: remote.local_address(),
            payload: excess.to_vec(),
        });
        let packets = remote.receive_packets(1024);
        let sent: usize = packets
            .iter()
            .map(|p| p.payload.len() - DataHeader::SIZE)
            .sum();
        assert_eq!(sent, wire_len - limit);
        assert_eq!(message.state(), OutboundState::Sent);
    }

    #[test]
    fn done_completes_message() {
        let (sender, hints, remote, _local) = setup();
        let message = message_with_payload(9, 10);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        hints.take();

        let done = CommonHeader::new(Opcode::Done, id(2, 1)).to_bytes();
        sender.handle_done_packet(&Packet {
            source: remote.local_address(),
            payload: done.to_vec(),
        });

        assert_eq!(message.state(), OutboundState::Completed);
        assert_eq!(hints.take(), Some(9));
    }

    #[test]
    fn error_fails_message() {
        let (sender, hints, remote, _local) = setup();
        let message = message_with_payload(9, 10);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        hints.take();

        let error = CommonHeader::new(Opcode::Error, id(2, 1)).to_bytes();
        sender.handle_error_packet(&Packet {
            source: remote.local_address(),
            payload: error.to_vec(),
        });

        assert_eq!(message.state(), OutboundState::Failed);
        assert_eq!(hints.take(), Some(9));
    }

    #[test]
    fn resend_retransmits_sent_bytes() {
        let (sender, _hints, remote, _local) = setup();
        let message = message_with_payload(9, 100);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        remote.receive_packets(32);

        let resend = ResendHeader::new(id(2, 1), 0, 50).to_bytes();
        sender.handle_resend_packet(&Packet {
            source: remote.local_address(),
            payload: resend.to_vec(),
        });

        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        let header = DataHeader::from_bytes(&packets[0].payload).unwrap();
        assert_eq!(header.common.opcode().unwrap(), Opcode::Data);
        assert_eq!(packets[0].payload.len(), DataHeader::SIZE + 50);
    }

    #[test]
    fn resend_for_unsent_bytes_answers_busy() {
        let (sender, _hints, remote, _local) = setup();
        let limit = TransportConfig::default().unscheduled_limit;
        let message = message_with_payload(9, 4 * limit);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        remote.receive_packets(1024);

        let resend = ResendHeader::new(id(2, 1), (2 * limit) as u32, 100).to_bytes();
        sender.handle_resend_packet(&Packet {
            source: remote.local_address(),
            payload: resend.to_vec(),
        });

        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        let header = CommonHeader::from_bytes(&packets[0].payload).unwrap();
        assert_eq!(header.opcode().unwrap(), Opcode::Busy);
    }

    #[test]
    fn resend_for_unknown_message_answers_unknown() {
        let (sender, _hints, remote, _local) = setup();

        let resend = ResendHeader::new(id(5, 1), 0, 100).to_bytes();
        sender.handle_resend_packet(&Packet {
            source: remote.local_address(),
            payload: resend.to_vec(),
        });

        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        let header = CommonHeader::from_bytes(&packets[0].payload).unwrap();
        assert_eq!(header.opcode().unwrap(), Opcode::Unknown);
    }

    #[test]
    fn unknown_restarts_transmission() {
        let (sender, _hints, remote, _local) = setup();
        let message = message_with_payload(9, 100);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        let first = remote.receive_packets(32);
        assert_eq!(first.len(), 1);

        let unknown = CommonHeader::new(Opcode::Unknown, id(2, 1)).to_bytes();
        sender.handle_unknown_packet(&Packet {
            source: remote.local_address(),
            payload: unknown.to_vec(),
        });

        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, first[0].payload);
        assert_eq!(message.state(), OutboundState::Sent);
    }

    #[test]
    fn quiet_message_pinged_then_failed() {
        let (sender, hints, remote, _local) = setup();
        let config = TransportConfig::default();
        let message = message_with_payload(9, 10);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        hints.take();
        remote.receive_packets(32);

        let start = monotonic_micros();
        sender.poll_at(start + config.ping_interval_us());
        let packets = remote.receive_packets(32);
        assert_eq!(packets.len(), 1);
        let header = CommonHeader::from_bytes(&packets[0].payload).unwrap();
        assert_eq!(header.opcode().unwrap(), Opcode::Ping);

        // Another poll inside the same interval does not ping again.
        sender.poll_at(start + config.ping_interval_us() + 1);
        assert!(remote.receive_packets(32).is_empty());

        sender.poll_at(start + config.message_timeout_us());
        assert_eq!(message.state(), OutboundState::Failed);
        assert_eq!(hints.take(), Some(9));
    }

    #[test]
    fn duplicate_send_is_dropped() {
        let (sender, _hints, remote, _local) = setup();
        let message = message_with_payload(9, 10);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        remote.receive_packets(32);
        sender.send_message(id(2, 1), remote.local_address(), &message);

        assert!(remote.receive_packets(32).is_empty());
    }

    #[test]
    fn drop_message_stops_tracking() {
        let (sender, hints, remote, _local) = setup();
        let config = TransportConfig::default();
        let message = message_with_payload(9, 10);

        sender.send_message(id(2, 1), remote.local_address(), &message);
        hints.take();
        sender.drop_message(&message);

        sender.poll_at(monotonic_micros() + config.message_timeout_us());
        // No timeout fires for a dropped message.
        assert_eq!(message.state(), OutboundState::Sent);
        assert_eq!(hints.take(), None);
    }
}
