//! Reliable, ordered delivery over raw datagrams.
//!
//! Every datagram carries a 17 byte header: sequence, latest received
//! sequence, a 32 bit history of earlier receipts, the highest sequence
//! delivered in order and flags. Acks ride on
//! outgoing data; a lone ack is sent only when nothing else is going out.
//! Unacknowledged segments are retransmitted on an RTO derived from smoothed
//! RTT, and the receiver reorders and deduplicates within its window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};
use crate::message::FrameError;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;
pub const SEGMENT_HEADER_LEN: usize = 17;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        const DATA = 0b0000_0001;
        const ACK = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    /// Everything at or below this was delivered in order.
    pub cumulative: u32,
    pub flags: SegmentFlags,
}

impl SegmentHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.ack.to_le_bytes());
        out.extend_from_slice(&self.ack_bitfield.to_le_bytes());
        out.extend_from_slice(&self.cumulative.to_le_bytes());
        out.push(self.flags.bits());
    }

    pub fn read(data: &[u8]) -> std::result::Result<Self, FrameError> {
        if data.len() < SEGMENT_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let flags = SegmentFlags::from_bits(data[16]).ok_or(FrameError::Malformed("segment flags"))?;
        Ok(Self {
            sequence: word(0),
            ack: word(4),
            ack_bitfield: word(8),
            cumulative: word(12),
            flags,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    /// Unacknowledged segments allowed in flight, and receive reorder span.
    pub window: usize,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub max_retransmits: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            window: 128,
            initial_rto_ms: 200,
            min_rto_ms: 30,
            max_rto_ms: 3000,
            max_retransmits: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingSegment {
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub retransmits: u32,
    pub acked: bool,
}

#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingSegment>,
    srtt: f32,
    rtt_var: f32,
    has_sample: bool,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            srtt: 100.0,
            rtt_var: 50.0,
            has_sample: false,
        }
    }

    pub fn track(&mut self, sequence: u32, payload: Vec<u8>, now: Instant) {
        self.pending.push_back(PendingSegment {
            sequence,
            payload,
            first_sent: now,
            last_sent: now,
            retransmits: 0,
            acked: false,
        });
    }

    pub fn process_ack(
        &mut self,
        ack: u32,
        ack_bitfield: u32,
        cumulative: u32,
        now: Instant,
    ) -> Vec<u32> {
        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();

        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }

            let is_acked = if pending.sequence == ack
                || pending.sequence == cumulative
                || sequence_greater_than(cumulative, pending.sequence)
            {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if is_acked {
                pending.acked = true;
                acked_sequences.push(pending.sequence);

                // Retransmitted segments give ambiguous samples.
                if pending.retransmits == 0 {
                    let rtt = now.duration_since(pending.first_sent).as_secs_f32() * 1000.0;
                    rtt_samples.push(rtt);
                }
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }

        acked_sequences
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if !self.has_sample {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
            self.has_sample = true;
            return;
        }

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count()
    }

    pub(crate) fn pending_mut(&mut self) -> impl Iterator<Item = &mut PendingSegment> {
        self.pending.iter_mut().filter(|p| !p.acked)
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
        }
    }

    pub fn record_received(&mut self, sequence: u32) {
        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                let shifted = self.received_bitfield.checked_shl(diff).unwrap_or(0);
                self.received_bitfield = shifted | (1 << (diff - 1));
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

/// Per-channel reliable overlay state.
#[derive(Debug)]
pub struct ReliableSession {
    config: ReliableConfig,
    next_sequence: u32,
    /// Framed segments the endpoint has not taken yet.
    staged: VecDeque<(u32, Vec<u8>)>,
    acks: AckTracker,
    received: ReceiveTracker,
    next_deliver: u32,
    reorder: HashMap<u32, Vec<u8>>,
    ack_owed: bool,
    duplicates: u64,
    retransmissions: u64,
}

impl ReliableSession {
    pub fn new(config: ReliableConfig) -> Self {
        Self {
            config,
            next_sequence: 1,
            staged: VecDeque::new(),
            acks: AckTracker::new(),
            received: ReceiveTracker::new(),
            next_deliver: 1,
            reorder: HashMap::new(),
            ack_owed: false,
            duplicates: 0,
            retransmissions: 0,
        }
    }

    fn rto(&self, retransmits: u32) -> Duration {
        let base = if self.acks.has_sample() {
            (self.acks.srtt() + 4.0 * self.acks.rtt_var()) as u64
        } else {
            self.config.initial_rto_ms
        };
        let backoff = base.saturating_mul(1u64 << retransmits.min(16));
        Duration::from_millis(backoff.clamp(self.config.min_rto_ms, self.config.max_rto_ms))
    }

    fn segment(&self, sequence: u32, flags: SegmentFlags, payload: &[u8]) -> Vec<u8> {
        let (ack, ack_bitfield) = self.received.ack_data();
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + payload.len());
        SegmentHeader {
            sequence,
            ack,
            ack_bitfield,
            cumulative: self.next_deliver.wrapping_sub(1),
            flags,
        }
        .write(&mut out);
        out.extend_from_slice(payload);
        out
    }

    /// Wraps `payload` as the next data segment. It is tracked for
    /// retransmission once [`confirm_sent`](Self::confirm_sent) reports that
    /// the endpoint took it.
    pub fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let in_flight = self.acks.unacked_count() + self.staged.len();
        if in_flight >= self.config.window {
            return Err(NetError::WindowFull(in_flight));
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        let segment = self.segment(sequence, SegmentFlags::DATA | SegmentFlags::ACK, payload);
        self.staged.push_back((sequence, payload.to_vec()));
        self.ack_owed = false;
        Ok(segment)
    }

    /// The oldest staged segment left the socket.
    pub fn confirm_sent(&mut self, now: Instant) {
        if let Some((sequence, payload)) = self.staged.pop_front() {
            self.acks.track(sequence, payload, now);
        }
    }

    /// Consumes one datagram and returns the payloads now deliverable in
    /// order.
    pub fn receive(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Vec<u8>>> {
        let header = SegmentHeader::read(datagram)?;
        if header.flags.contains(SegmentFlags::ACK) {
            self.acks
                .process_ack(header.ack, header.ack_bitfield, header.cumulative, now);
        }

        let mut delivered = Vec::new();
        if !header.flags.contains(SegmentFlags::DATA) {
            return Ok(delivered);
        }

        let sequence = header.sequence;
        if sequence_greater_than(self.next_deliver, sequence) || self.reorder.contains_key(&sequence) {
            self.duplicates += 1;
            self.ack_owed = true;
            return Ok(delivered);
        }
        if sequence.wrapping_sub(self.next_deliver) as usize >= self.config.window {
            log::debug!(
                "segment {} outside receive window starting at {}",
                sequence,
                self.next_deliver
            );
            return Ok(delivered);
        }

        self.received.record_received(sequence);
        self.ack_owed = true;
        self.reorder
            .insert(sequence, datagram[SEGMENT_HEADER_LEN..].to_vec());

        while let Some(payload) = self.reorder.remove(&self.next_deliver) {
            delivered.push(payload);
            self.next_deliver = self.next_deliver.wrapping_add(1).max(1);
        }
        Ok(delivered)
    }

    /// Produces retransmissions that are due and a bare ack if one is owed.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<Vec<u8>>> {
        let mut due = Vec::new();
        let max_retransmits = self.config.max_retransmits;

        let rtos: Vec<Duration> = (0..=max_retransmits).map(|n| self.rto(n)).collect();
        for pending in self.acks.pending_mut() {
            let rto = rtos[pending.retransmits.min(max_retransmits) as usize];
            if now.duration_since(pending.last_sent) < rto {
                continue;
            }
            if pending.retransmits >= max_retransmits {
                return Err(NetError::PeerUnresponsive(pending.retransmits));
            }
            pending.retransmits += 1;
            pending.last_sent = now;
            due.push((pending.sequence, pending.payload.clone()));
        }

        let mut out = Vec::with_capacity(due.len() + 1);
        for (sequence, payload) in due {
            self.retransmissions += 1;
            out.push(self.segment(sequence, SegmentFlags::DATA | SegmentFlags::ACK, &payload));
        }

        if out.is_empty() && self.ack_owed {
            out.push(self.segment(0, SegmentFlags::ACK, &[]));
        }
        self.ack_owed = false;
        Ok(out)
    }

    pub fn in_flight(&self) -> usize {
        self.acks.unacked_count()
    }

    pub fn srtt_ms(&self) -> f32 {
        self.acks.srtt()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ReliableSession {
        ReliableSession::new(ReliableConfig::default())
    }

    fn send_now(session: &mut ReliableSession, payload: &[u8], now: Instant) -> Vec<u8> {
        let segment = session.send(payload).unwrap();
        session.confirm_sent(now);
        segment
    }

    #[test]
    fn test_sequence_wrap() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new();
        let start = Instant::now();

        tracker.track(1, vec![], start);
        let acked = tracker.process_ack(1, 0, 0, start + Duration::from_millis(40));

        assert_eq!(acked, vec![1]);
        assert!((tracker.srtt() - 40.0).abs() < 1.0);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_cumulative_ack_clears_beyond_bitfield() {
        let mut tracker = AckTracker::new();
        let start = Instant::now();
        for sequence in 1..=40 {
            tracker.track(sequence, vec![], start);
        }

        let acked = tracker.process_ack(40, u32::MAX, 40, start);
        assert_eq!(acked.len(), 40);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_reordered_segments_delivered_in_order() {
        let now = Instant::now();
        let mut sender = session();
        let mut receiver = session();

        let segments: Vec<Vec<u8>> = (0..4u8).map(|i| send_now(&mut sender, &[i], now)).collect();

        let mut delivered = Vec::new();
        for index in [2, 0, 3, 1] {
            delivered.extend(receiver.receive(&segments[index], now).unwrap());
        }
        assert_eq!(delivered, vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let now = Instant::now();
        let mut sender = session();
        let mut receiver = session();

        let first = send_now(&mut sender, b"a", now);
        let second = send_now(&mut sender, b"b", now);

        assert_eq!(receiver.receive(&second, now).unwrap(), Vec::<Vec<u8>>::new());
        assert!(receiver.receive(&second, now).unwrap().is_empty());
        assert_eq!(receiver.receive(&first, now).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(receiver.receive(&first, now).unwrap().is_empty());
        assert_eq!(receiver.duplicates(), 2);
    }

    #[test]
    fn test_ack_only_segment_clears_sender() {
        let now = Instant::now();
        let mut sender = session();
        let mut receiver = session();

        let segment = send_now(&mut sender, b"x", now);
        receiver.receive(&segment, now).unwrap();

        let acks = receiver.poll(now).unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].len(), SEGMENT_HEADER_LEN);

        assert!(sender.receive(&acks[0], now).unwrap().is_empty());
        assert_eq!(sender.in_flight(), 0);
    }

    #[test]
    fn test_burst_wider_than_bitfield_is_fully_acked() {
        let now = Instant::now();
        let mut sender = session();
        let mut receiver = session();

        let segments: Vec<Vec<u8>> = (0..40u8).map(|i| send_now(&mut sender, &[i], now)).collect();
        let mut delivered = 0;
        for segment in &segments {
            delivered += receiver.receive(segment, now).unwrap().len();
        }
        assert_eq!(delivered, 40);

        let acks = receiver.poll(now).unwrap();
        assert_eq!(acks.len(), 1);
        sender.receive(&acks[0], now).unwrap();
        assert_eq!(sender.in_flight(), 0);

        let later = now + Duration::from_secs(5);
        assert!(sender.poll(later).unwrap().is_empty());
    }

    #[test]
    fn test_lossy_reordering_link_delivers_everything() {
        const TOTAL: u16 = 500;
        let mut sender = session();
        let mut receiver = session();
        let mut now = Instant::now();

        let mut next_payload = 0u16;
        let mut delivered: Vec<Vec<u8>> = Vec::new();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut lose = |one_in: u64| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 33) % one_in == 0
        };

        for _ in 0..5000 {
            let mut outgoing = sender.poll(now).unwrap();
            while next_payload < TOTAL && sender.in_flight() < 64 {
                outgoing.push(send_now(&mut sender, &next_payload.to_le_bytes(), now));
                next_payload += 1;
            }

            // Reverse each burst; lose about a fifth of the data and a
            // seventh of the acks.
            outgoing.reverse();
            for datagram in outgoing {
                if lose(5) {
                    continue;
                }
                delivered.extend(receiver.receive(&datagram, now).unwrap());
            }

            for ack in receiver.poll(now).unwrap() {
                if lose(7) {
                    continue;
                }
                sender.receive(&ack, now).unwrap();
            }

            if next_payload == TOTAL && sender.in_flight() == 0 {
                break;
            }
            now += Duration::from_millis(50);
        }

        let expected: Vec<Vec<u8>> = (0..TOTAL).map(|i| i.to_le_bytes().to_vec()).collect();
        assert_eq!(delivered, expected);
        assert_eq!(sender.in_flight(), 0);
        assert!(sender.retransmissions() > 0);
    }

    #[test]
    fn test_unconfirmed_segment_is_not_retransmitted() {
        let mut sender = session();
        let start = Instant::now();
        sender.send(b"never left").unwrap();

        assert_eq!(sender.in_flight(), 0);
        assert!(sender.poll(start + Duration::from_secs(5)).unwrap().is_empty());

        sender.confirm_sent(start);
        assert_eq!(sender.in_flight(), 1);
    }

    #[test]
    fn test_retransmit_then_give_up() {
        let config = ReliableConfig {
            max_retransmits: 2,
            ..ReliableConfig::default()
        };
        let mut sender = ReliableSession::new(config);
        let start = Instant::now();
        send_now(&mut sender, b"lost", start);

        assert!(sender.poll(start).unwrap().is_empty());

        let later = start + Duration::from_secs(1);
        let resent = sender.poll(later).unwrap();
        assert_eq!(resent.len(), 1);
        assert_eq!(&resent[0][SEGMENT_HEADER_LEN..], b"lost");

        let later = later + Duration::from_secs(4);
        assert_eq!(sender.poll(later).unwrap().len(), 1);

        let later = later + Duration::from_secs(4);
        assert!(matches!(sender.poll(later), Err(NetError::PeerUnresponsive(2))));
    }

    #[test]
    fn test_window_full_is_transient() {
        let config = ReliableConfig {
            window: 2,
            ..ReliableConfig::default()
        };
        let mut sender = ReliableSession::new(config);
        sender.send(b"1").unwrap();
        sender.send(b"2").unwrap();
        let err = sender.send(b"3").unwrap_err();
        assert!(err.reason().is_transient());
    }
}
