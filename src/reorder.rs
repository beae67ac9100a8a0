// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-bounded reordering of incoming packets by RTP sequence number.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;

use crate::pkt::{BufferedPacket, PacketFactory};

/// Default time to wait at the head of the queue for a missing earlier
/// packet before giving up on it: 100 ms.
const DEFAULT_THRESHOLD: Duration = Duration::from_millis(100);

/// Wrap-aware sequence-number ordering, [RFC 3550 appendix
/// A.1](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.1)-style:
/// `a` precedes `b` iff `b - a` (mod 2^16) lies in `(0, 2^15]`.
///
/// At the exact antipode (`b - a == 2^15`) the direction is ambiguous and
/// both orderings hold; real streams never queue packets that far apart.
#[inline]
pub(crate) fn seq_num_lt(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff <= 0x8000
}

/// Why [`ReorderBuffer::store`] refused (and freed) a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StoreOutcome {
    Stored,
    /// Sequence number precedes `next_expected_seq`: excessively delayed.
    Stale,
    Duplicate,
}

/// An ordered queue of in-flight packets keyed by sequence number.
///
/// All queued packets satisfy `next_expected_seq <= seq` under
/// [`seq_num_lt`], strictly increasing front to back with no duplicates.
/// One spare packet is cached so that the steady state (read, deliver,
/// release, read...) allocates nothing.
pub(crate) struct ReorderBuffer {
    queue: VecDeque<BufferedPacket>,
    spare: Option<BufferedPacket>,
    factory: Box<dyn PacketFactory>,
    next_expected_seq: u16,
    have_seen_first_packet: bool,
    threshold: Duration,
}

impl ReorderBuffer {
    pub fn new(factory: Box<dyn PacketFactory>) -> Self {
        ReorderBuffer {
            queue: VecDeque::new(),
            spare: None,
            factory,
            next_expected_seq: 0,
            have_seen_first_packet: false,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn set_threshold_time(&mut self, usec: u32) {
        self.threshold = Duration::from_micros(u64::from(usec));
    }

    /// Forces the next stored packet to re-seed `next_expected_seq`, as on
    /// an SSRC change.
    pub fn reset_have_seen_first_packet(&mut self) {
        self.have_seen_first_packet = false;
    }

    /// Frees every queued packet and the spare.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.spare = None;
        self.have_seen_first_packet = false;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn next_expected_seq(&self) -> u16 {
        self.next_expected_seq
    }

    /// Returns a packet ready for filling: the cached spare when available,
    /// a fresh allocation otherwise.
    pub fn get_free_packet(&mut self) -> BufferedPacket {
        match self.spare.take() {
            Some(pkt) => pkt,
            None => self.factory.create_packet(),
        }
    }

    /// Surrenders a packet, keeping it as the spare if that slot is empty.
    pub fn free_packet(&mut self, pkt: BufferedPacket) {
        if self.spare.is_none() {
            self.spare = Some(pkt);
        }
    }

    /// Inserts by sequence number. Stale and duplicate packets are freed and
    /// reported as such.
    pub fn store(&mut self, mut pkt: BufferedPacket) -> StoreOutcome {
        let seq = pkt.seq_no();
        if !self.have_seen_first_packet {
            self.next_expected_seq = seq;
            pkt.set_first_packet();
            self.have_seen_first_packet = true;
        }

        if seq_num_lt(seq, self.next_expected_seq) {
            self.free_packet(pkt);
            return StoreOutcome::Stale;
        }

        let tail_seq = match self.queue.back() {
            None => {
                self.queue.push_back(pkt);
                return StoreOutcome::Stored;
            }
            Some(tail) => tail.seq_no(),
        };

        // Common case: in-order arrival.
        if seq_num_lt(tail_seq, seq) {
            self.queue.push_back(pkt);
            return StoreOutcome::Stored;
        }
        if seq == tail_seq {
            self.free_packet(pkt);
            return StoreOutcome::Duplicate;
        }

        // Out of order: scan from the front for the insertion point.
        let mut idx = self.queue.len();
        for (i, queued) in self.queue.iter().enumerate() {
            if queued.seq_no() == seq {
                self.free_packet(pkt);
                return StoreOutcome::Duplicate;
            }
            if seq_num_lt(seq, queued.seq_no()) {
                idx = i;
                break;
            }
        }
        trace!("inserting out-of-order seq={:04x} at index {}", seq, idx);
        self.queue.insert(idx, pkt);
        StoreOutcome::Stored
    }

    /// Returns the head packet if it is deliverable, along with whether
    /// packet loss preceded it.
    ///
    /// The head is deliverable when it carries the expected sequence number,
    /// or when it has aged past the reordering threshold (the gap before it
    /// is then declared lost and `next_expected_seq` jumps forward). The
    /// very first packet of an epoch reports loss, forcing any stale
    /// partial-frame state downstream to flush.
    pub fn next_completed(&mut self, now: Instant) -> Option<(&mut BufferedPacket, bool)> {
        let (head_seq, is_first, received) = {
            let head = self.queue.front()?;
            (head.seq_no(), head.is_first_packet(), head.time_received())
        };
        let loss_preceded = if head_seq == self.next_expected_seq {
            is_first
        } else if now.saturating_duration_since(received) > self.threshold {
            trace!(
                "giving up on seq={:04x}..{:04x} after threshold",
                self.next_expected_seq,
                head_seq.wrapping_sub(1)
            );
            self.next_expected_seq = head_seq;
            true
        } else {
            return None;
        };
        self.queue.front_mut().map(|pkt| (pkt, loss_preceded))
    }

    /// Releases the head packet once the consumer is completely done with
    /// it, advancing `next_expected_seq` past it.
    pub fn release_used_packet(&mut self) {
        if let Some(pkt) = self.queue.pop_front() {
            debug_assert_eq!(pkt.seq_no(), self.next_expected_seq);
            self.next_expected_seq = pkt.seq_no().wrapping_add(1);
            self.free_packet(pkt);
        }
    }
}
