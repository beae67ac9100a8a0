// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator seams of the depacketization engine.
//!
//! [`source::RtpSource`](crate::source::RtpSource) is deliberately generic
//! over everything that isn't depacketization: where datagrams come from
//! ([`NetReader`]), how deferred work is posted ([`Scheduler`]), how
//! reception statistics and presentation times are computed ([`RecvStats`]),
//! what per-codec packetization rules apply ([`PayloadFormat`]), and who
//! consumes the frames ([`FrameSink`]).

use std::io;
use std::net::SocketAddr;

use crate::pkt::BufferedPacket;
use crate::WallTime;

/// Result of one [`NetReader::handle_read`] call.
#[derive(Clone, Copy, Debug)]
pub enum ReadOutcome {
    /// A whole datagram was read.
    Complete { len: usize, from: SocketAddr },

    /// Only part of the datagram was available; the caller should retain the
    /// packet and call again on the next readability event.
    ///
    /// This never happens on plain UDP; it exists for transports that
    /// interleave RTP over a stream (eg RTP-over-RTSP over TCP).
    Partial { len: usize },
}

/// Supplies raw RTP datagrams to the engine.
pub trait NetReader {
    /// Reads the next datagram (or next piece of one) into `buf`.
    fn handle_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;
}

/// Posts deferred wakeups, used to bound recursion when delivering frames.
///
/// When a frame completes while more packets are queued, the engine parks
/// the frame, calls `schedule(0)`, and expects the event loop to invoke
/// [`RtpSource::on_wakeup`](crate::source::RtpSource::on_wakeup) once the
/// delay elapses. A wakeup arriving after
/// [`stop_getting_frames`](crate::source::RtpSource::stop_getting_frames)
/// is harmless: `on_wakeup` checks whether anything is still pending, so
/// implementations needn't cancel scheduled tasks.
pub trait Scheduler {
    fn schedule(&mut self, delay_usec: u64);
}

/// Presentation timing computed for an accepted packet.
#[derive(Clone, Copy, Debug)]
pub struct PacketTiming {
    pub presentation_time: WallTime,

    /// True if `presentation_time` was derived from an RTCP sender report
    /// rather than extrapolated from the local clock.
    pub synced_via_rtcp: bool,
}

/// RTCP reception-statistics bookkeeping.
///
/// Notified of every packet that survives header validation, before it
/// enters the reordering queue. The returned [`PacketTiming`] is recorded on
/// the packet and reported with each frame it yields.
pub trait RecvStats {
    fn note_incoming_packet(
        &mut self,
        ssrc: u32,
        seq_no: u16,
        timestamp: u32,
        timestamp_frequency: u32,
        usable_in_jitter_calc: bool,
        packet_size: usize,
    ) -> PacketTiming;
}

/// A [`RecvStats`] that stamps each packet with the local wall clock and
/// never claims RTCP synchronization. Suitable when no RTCP machinery is
/// wired up.
#[derive(Debug, Default)]
pub struct SystemClockStats;

impl RecvStats for SystemClockStats {
    fn note_incoming_packet(
        &mut self,
        _ssrc: u32,
        _seq_no: u16,
        _timestamp: u32,
        _timestamp_frequency: u32,
        _usable_in_jitter_calc: bool,
        _packet_size: usize,
    ) -> PacketTiming {
        PacketTiming {
            presentation_time: WallTime::now(),
            synced_via_rtcp: false,
        }
    }
}

/// Whether the current packet begins and/or completes a frame.
///
/// Both default to true (each packet carries whole frames); fragmenting
/// payload formats override them per packet from
/// [`PayloadFormat::process_special_header`].
#[derive(Clone, Copy, Debug)]
pub struct FrameBoundaries {
    pub begins_frame: bool,
    pub completes_frame: bool,
}

impl Default for FrameBoundaries {
    fn default() -> Self {
        FrameBoundaries {
            begins_frame: true,
            completes_frame: true,
        }
    }
}

/// Location and duration of the next enclosed frame within a packet's
/// remaining payload, as reported by [`PayloadFormat::next_enclosed_frame`].
#[derive(Clone, Copy, Debug)]
pub struct EnclosedFrame {
    /// Bytes of inline per-frame header to step over before the frame.
    pub offset: usize,
    pub len: usize,
    pub duration_usec: u32,
}

/// Payload-format-specific packetization rules.
///
/// The defaults describe the trivial format: no special header, the whole
/// remaining payload is one frame of unknown duration, and every packet is
/// usable for jitter calculation.
///
/// Note the loss-recovery limitation: after a loss inside a fragmented
/// frame, delivery resynchronizes at the next packet whose
/// [`FrameBoundaries::begins_frame`] is true. Formats that cannot mark frame
/// starts will not resynchronize cleanly.
pub trait PayloadFormat {
    /// Examines a packet once, before any of its payload is consumed.
    ///
    /// May inspect the packet (including its RTP marker bit), adjust `frame`
    /// to describe fragmentation, and strip bytes itself via
    /// [`BufferedPacket::skip`]. Returns the number of additional
    /// special-header bytes to strip, or `None` to reject the packet.
    fn process_special_header(
        &mut self,
        pkt: &mut BufferedPacket,
        frame: &mut FrameBoundaries,
    ) -> Option<usize> {
        let _ = (pkt, frame);
        Some(0)
    }

    /// Describes the next enclosed frame within `payload` (the packet's
    /// remaining bytes).
    fn next_enclosed_frame(&mut self, payload: &[u8]) -> EnclosedFrame {
        EnclosedFrame {
            offset: 0,
            len: payload.len(),
            duration_usec: 0,
        }
    }

    /// Whether this packet should participate in interarrival-jitter
    /// calculation; forwarded to [`RecvStats::note_incoming_packet`].
    fn usable_in_jitter_calculation(&self, payload: &[u8]) -> bool {
        let _ = payload;
        true
    }
}

/// The trivial [`PayloadFormat`]: whole packets, whole frames.
#[derive(Debug, Default)]
pub struct DefaultFormat;

impl PayloadFormat for DefaultFormat {}

/// A caller-supplied destination for one frame.
///
/// The buffer is cleared and then filled with up to `max_size` bytes; any
/// excess is counted in [`DeliveredFrame::truncated_bytes`] rather than
/// delivered.
#[derive(Debug)]
pub struct FrameDest {
    pub(crate) buf: Vec<u8>,
    pub(crate) max_size: usize,
}

impl FrameDest {
    /// Wraps `buf` (typically recycled from the previous
    /// [`DeliveredFrame`]) as a destination holding at most `max_size`
    /// bytes.
    pub fn new(mut buf: Vec<u8>, max_size: usize) -> Self {
        buf.clear();
        FrameDest { buf, max_size }
    }
}

/// A complete frame and its metadata, handed to [`FrameSink::after_getting`].
#[derive(Debug)]
pub struct DeliveredFrame {
    /// The frame bytes; `data.len()` is the frame size after any truncation.
    pub data: Vec<u8>,

    /// Bytes dropped because the frame exceeded the destination's
    /// `max_size`.
    pub truncated_bytes: usize,

    /// True if packet loss preceded this frame. The very first frame of a
    /// stream (or of a new SSRC epoch) is reported as loss-preceded.
    pub loss_preceded: bool,

    pub seq_no: u16,
    pub timestamp: u32,
    pub presentation_time: WallTime,
    pub synced_via_rtcp: bool,
    pub marker: bool,
}

/// The downstream frame consumer.
pub trait FrameSink {
    /// Receives one complete frame. Returning `Some` immediately requests
    /// the next frame (the engine continues iteratively, so this cannot
    /// recurse); returning `None` leaves the engine idle until the next
    /// [`get_next_frame`](crate::source::RtpSource::get_next_frame).
    fn after_getting(&mut self, frame: DeliveredFrame) -> Option<FrameDest>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_transparent() {
        let mut f = DefaultFormat::default();
        let mut pkt = BufferedPacket::with_capacity(64);
        pkt.append_data(b"abc");
        let mut frame = FrameBoundaries::default();
        assert_eq!(f.process_special_header(&mut pkt, &mut frame), Some(0));
        assert!(frame.begins_frame);
        assert!(frame.completes_frame);
        let e = f.next_enclosed_frame(pkt.data());
        assert_eq!((e.offset, e.len, e.duration_usec), (0, 3, 0));
        assert!(f.usable_in_jitter_calculation(pkt.data()));
    }

    #[test]
    fn system_clock_stats_never_synced() {
        let mut stats = SystemClockStats::default();
        let timing = stats.note_incoming_packet(1, 2, 3, 90_000, true, 100);
        assert!(!timing.synced_via_rtcp);
    }

    #[test]
    fn frame_dest_clears_recycled_buf() {
        let dest = FrameDest::new(vec![1, 2, 3], 10);
        assert!(dest.buf.is_empty());
        assert_eq!(dest.max_size, 10);
    }
}
