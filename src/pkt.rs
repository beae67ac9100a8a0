// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet buffers: fixed-capacity byte storage plus RTP metadata.

use std::io;
use std::time::Instant;

use pretty_hex::PrettyHex;

use crate::hooks::{NetReader, PayloadFormat, ReadOutcome};
use crate::WallTime;

/// Default capacity of a [`BufferedPacket`], comfortably above any sane MTU.
pub const MAX_PACKET_SIZE: usize = 10_000;

/// One received RTP packet: a fixed-capacity buffer with two cursors and
/// the metadata extracted from its header.
///
/// `[0, head)` has been consumed, `[head, tail)` is usable payload, and
/// `[tail, capacity)` is free. A packet whose payload encloses several
/// frames is `use`d once per frame; `use_count` tracks how far along it is.
pub struct BufferedPacket {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    use_count: u32,
    is_first_packet: bool,
    seq_no: u16,
    timestamp: u32,
    marker: bool,
    synced_via_rtcp: bool,
    presentation_time: WallTime,
    time_received: Instant,
}

/// What one [`BufferedPacket::use_frame`] call produced: the byte counts
/// plus a snapshot of the packet metadata to report alongside the frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UsedFrame {
    pub bytes_used: usize,
    pub bytes_truncated: usize,
    pub seq_no: u16,
    pub timestamp: u32,
    pub presentation_time: WallTime,
    pub synced_via_rtcp: bool,
    pub marker: bool,
}

impl BufferedPacket {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PACKET_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BufferedPacket {
            buf: vec![0; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            use_count: 0,
            is_first_packet: false,
            seq_no: 0,
            timestamp: 0,
            marker: false,
            synced_via_rtcp: false,
            presentation_time: WallTime::default(),
            time_received: Instant::now(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.use_count = 0;
        self.is_first_packet = false;
    }

    /// Reads a datagram (or the next piece of one) from `net`.
    ///
    /// When not resuming a partial read, the cursors are reset first. On
    /// [`ReadOutcome::Partial`] the caller must retain this packet and call
    /// again, with `resuming` true, on the next readability event.
    pub(crate) fn fill_in_data(
        &mut self,
        net: &mut dyn NetReader,
        resuming: bool,
    ) -> io::Result<ReadOutcome> {
        if !resuming {
            self.reset();
        }
        let outcome = net.handle_read(&mut self.buf[self.tail..])?;
        match outcome {
            ReadOutcome::Complete { len, .. } | ReadOutcome::Partial { len } => {
                self.tail += len.min(self.buf.len() - self.tail)
            }
        }
        Ok(outcome)
    }

    /// The usable payload, `[head, tail)`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Consumes `n` bytes from the front of the payload, clamped to what's
    /// available.
    pub fn skip(&mut self, n: usize) {
        self.head = (self.head + n).min(self.tail);
    }

    /// Drops `n` trailing bytes (RTP padding), clamped to what's available.
    pub fn remove_padding(&mut self, n: usize) {
        self.tail -= n.min(self.tail - self.head);
    }

    /// Appends bytes after the current payload, clamped to the remaining
    /// capacity.
    pub fn append_data(&mut self, data: &[u8]) {
        let n = data.len().min(self.buf.len() - self.tail);
        self.buf[self.tail..self.tail + n].copy_from_slice(&data[..n]);
        self.tail += n;
    }

    #[inline]
    pub fn has_usable_data(&self) -> bool {
        self.head < self.tail
    }

    pub(crate) fn assign_misc_params(
        &mut self,
        seq_no: u16,
        timestamp: u32,
        presentation_time: WallTime,
        synced_via_rtcp: bool,
        marker: bool,
        time_received: Instant,
    ) {
        self.seq_no = seq_no;
        self.timestamp = timestamp;
        self.presentation_time = presentation_time;
        self.synced_via_rtcp = synced_via_rtcp;
        self.marker = marker;
        self.time_received = time_received;
    }

    /// Slices the next enclosed frame into `dest`, appending at most
    /// `max_size` bytes.
    ///
    /// A frame larger than `max_size` is truncated but still consumed in
    /// full from the packet, so the following `use_frame` starts at the next
    /// frame. The packet's presentation time advances by the frame's
    /// duration afterward, so a multi-frame packet stamps each enclosed
    /// frame correctly.
    pub(crate) fn use_frame(
        &mut self,
        format: &mut dyn PayloadFormat,
        dest: &mut Vec<u8>,
        max_size: usize,
    ) -> UsedFrame {
        let avail = &self.buf[self.head..self.tail];
        let enclosed = format.next_enclosed_frame(avail);
        let offset = enclosed.offset.min(avail.len());
        let frame_size = enclosed.len.min(avail.len() - offset);
        let (bytes_used, bytes_truncated) = if frame_size > max_size {
            (max_size, frame_size - max_size)
        } else {
            (frame_size, 0)
        };
        dest.extend_from_slice(&avail[offset..offset + bytes_used]);
        self.head += offset + frame_size;
        self.use_count += 1;
        let used = UsedFrame {
            bytes_used,
            bytes_truncated,
            seq_no: self.seq_no,
            timestamp: self.timestamp,
            presentation_time: self.presentation_time,
            synced_via_rtcp: self.synced_via_rtcp,
            marker: self.marker,
        };
        self.presentation_time.add_usec(enclosed.duration_usec);
        used
    }

    #[inline]
    pub fn seq_no(&self) -> u16 {
        self.seq_no
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    #[inline]
    pub fn marker(&self) -> bool {
        self.marker
    }

    #[inline]
    pub fn synced_via_rtcp(&self) -> bool {
        self.synced_via_rtcp
    }

    #[inline]
    pub fn presentation_time(&self) -> WallTime {
        self.presentation_time
    }

    #[inline]
    pub(crate) fn time_received(&self) -> Instant {
        self.time_received
    }

    #[inline]
    pub(crate) fn use_count(&self) -> u32 {
        self.use_count
    }

    #[inline]
    pub(crate) fn is_first_packet(&self) -> bool {
        self.is_first_packet
    }

    pub(crate) fn set_first_packet(&mut self) {
        self.is_first_packet = true;
    }
}

impl Default for BufferedPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedPacket")
            .field("seq_no", &self.seq_no)
            .field("timestamp", &self.timestamp)
            .field("marker", &self.marker)
            .field("use_count", &self.use_count)
            .field("data", &self.data().hex_dump())
            .finish()
    }
}

/// Allocation seam for [`BufferedPacket`]s, letting callers size buffers
/// for their transport.
pub trait PacketFactory {
    fn create_packet(&mut self) -> BufferedPacket {
        BufferedPacket::new()
    }
}

/// Produces [`MAX_PACKET_SIZE`]-byte packets.
#[derive(Debug, Default)]
pub struct DefaultPacketFactory;

impl PacketFactory for DefaultPacketFactory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{DefaultFormat, EnclosedFrame};

    struct OneShotReader(Vec<u8>, bool);

    impl NetReader for OneShotReader {
        fn handle_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            let len = self.0.len();
            buf[..len].copy_from_slice(&self.0);
            if self.1 {
                Ok(ReadOutcome::Partial { len })
            } else {
                Ok(ReadOutcome::Complete {
                    len,
                    from: "127.0.0.1:5004".parse().unwrap(),
                })
            }
        }
    }

    #[test]
    fn cursor_ops_clamp() {
        let mut pkt = BufferedPacket::with_capacity(8);
        pkt.append_data(b"abcdef");
        assert_eq!(pkt.data(), b"abcdef");
        pkt.skip(2);
        assert_eq!(pkt.data(), b"cdef");
        pkt.skip(100);
        assert_eq!(pkt.data_size(), 0);
        assert!(!pkt.has_usable_data());

        pkt.reset();
        pkt.append_data(b"abcdef");
        pkt.remove_padding(2);
        assert_eq!(pkt.data(), b"abcd");
        pkt.remove_padding(100);
        assert_eq!(pkt.data_size(), 0);
    }

    #[test]
    fn append_clamps_to_capacity() {
        let mut pkt = BufferedPacket::with_capacity(4);
        pkt.append_data(b"abcdef");
        assert_eq!(pkt.data(), b"abcd");
        pkt.append_data(b"gh");
        assert_eq!(pkt.data(), b"abcd");
    }

    #[test]
    fn fill_resets_unless_resuming() {
        let mut pkt = BufferedPacket::with_capacity(64);
        let mut first = OneShotReader(b"01234".to_vec(), true);
        match pkt.fill_in_data(&mut first, false).unwrap() {
            ReadOutcome::Partial { len } => assert_eq!(len, 5),
            other => panic!("expected partial, got {:?}", other),
        }
        let mut rest = OneShotReader(b"56789".to_vec(), false);
        match pkt.fill_in_data(&mut rest, true).unwrap() {
            ReadOutcome::Complete { len, .. } => assert_eq!(len, 5),
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(pkt.data(), b"0123456789");

        // A non-resuming fill discards whatever came before.
        let mut next = OneShotReader(b"xyz".to_vec(), false);
        pkt.fill_in_data(&mut next, false).unwrap();
        assert_eq!(pkt.data(), b"xyz");
    }

    #[test]
    fn use_frame_whole_payload() {
        let mut pkt = BufferedPacket::with_capacity(64);
        pkt.append_data(b"hello");
        pkt.assign_misc_params(
            7,
            90_000,
            WallTime { sec: 3, usec: 0 },
            true,
            true,
            Instant::now(),
        );
        let mut fmt = DefaultFormat::default();
        let mut dest = Vec::new();
        let used = pkt.use_frame(&mut fmt, &mut dest, 100);
        assert_eq!(dest, b"hello");
        assert_eq!(used.bytes_used, 5);
        assert_eq!(used.bytes_truncated, 0);
        assert_eq!(used.seq_no, 7);
        assert_eq!(used.timestamp, 90_000);
        assert!(used.synced_via_rtcp);
        assert!(used.marker);
        assert_eq!(pkt.use_count(), 1);
        assert!(!pkt.has_usable_data());
    }

    #[test]
    fn use_frame_truncates_but_consumes() {
        let mut pkt = BufferedPacket::with_capacity(64);
        pkt.append_data(b"0123456789");
        let mut fmt = DefaultFormat::default();
        let mut dest = Vec::new();
        let used = pkt.use_frame(&mut fmt, &mut dest, 4);
        assert_eq!(dest, b"0123");
        assert_eq!(used.bytes_used, 4);
        assert_eq!(used.bytes_truncated, 6);
        // The truncated tail is consumed too; nothing is left over.
        assert!(!pkt.has_usable_data());
    }

    /// Fixed-size frames with a per-frame duration and a 1-byte inline
    /// header, to exercise the offset and presentation-time paths.
    struct TinyFrames;

    impl PayloadFormat for TinyFrames {
        fn next_enclosed_frame(&mut self, payload: &[u8]) -> EnclosedFrame {
            EnclosedFrame {
                offset: 1,
                len: 2.min(payload.len().saturating_sub(1)),
                duration_usec: 700_000,
            }
        }
    }

    #[test]
    fn use_frame_advances_presentation_time() {
        let mut pkt = BufferedPacket::with_capacity(64);
        pkt.append_data(b"\x01AA\x02BB");
        pkt.assign_misc_params(
            1,
            0,
            WallTime {
                sec: 10,
                usec: 600_000,
            },
            false,
            false,
            Instant::now(),
        );
        let mut fmt = TinyFrames;
        let mut dest = Vec::new();

        let first = pkt.use_frame(&mut fmt, &mut dest, 100);
        assert_eq!(dest, b"AA");
        assert_eq!(
            first.presentation_time,
            WallTime {
                sec: 10,
                usec: 600_000
            }
        );
        assert!(pkt.has_usable_data());

        dest.clear();
        let second = pkt.use_frame(&mut fmt, &mut dest, 100);
        assert_eq!(dest, b"BB");
        assert_eq!(
            second.presentation_time,
            WallTime {
                sec: 11,
                usec: 300_000
            }
        );
        assert_eq!(pkt.use_count(), 2);
        assert!(!pkt.has_usable_data());
    }

    #[test]
    fn use_frame_clamps_bogus_format_output() {
        struct Liar;
        impl PayloadFormat for Liar {
            fn next_enclosed_frame(&mut self, _payload: &[u8]) -> EnclosedFrame {
                EnclosedFrame {
                    offset: 3,
                    len: usize::MAX,
                    duration_usec: 0,
                }
            }
        }
        let mut pkt = BufferedPacket::with_capacity(16);
        pkt.append_data(b"xyzab");
        let mut dest = Vec::new();
        let used = pkt.use_frame(&mut Liar, &mut dest, 100);
        assert_eq!(dest, b"ab");
        assert_eq!(used.bytes_used, 2);
        assert!(!pkt.has_usable_data());
    }
}
