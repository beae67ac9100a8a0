// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The depacketization driver; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use std::time::Instant;

use bytes::Buf;
use log::{debug, trace, warn};
use pretty_hex::PrettyHex;

use crate::hooks::{
    FrameBoundaries, FrameDest, FrameSink, NetReader, PayloadFormat, ReadOutcome, RecvStats,
    Scheduler,
};
use crate::pkt::{BufferedPacket, DefaultPacketFactory, PacketFactory};
use crate::reorder::{ReorderBuffer, StoreOutcome};
use crate::{Error, WallTime};

/// Per-stream configuration.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// The RTP payload type this stream carries; packets with any other
    /// payload type are dropped.
    pub payload_format: u8,

    /// RTP timestamp clock rate in Hz (eg 90 000 for video).
    pub timestamp_frequency: u32,

    /// Maximum time to wait for a missing packet before declaring it lost.
    pub reordering_threshold_usec: u32,
}

impl SourceConfig {
    pub fn new(payload_format: u8, timestamp_frequency: u32) -> Self {
        SourceConfig {
            payload_format,
            timestamp_frequency,
            reordering_threshold_usec: 100_000,
        }
    }
}

/// Fields of the RTP fixed header the engine acts on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct RtpHeader {
    seq_no: u16,
    timestamp: u32,
    ssrc: u32,
    marker: bool,
    payload_type: u8,
}

/// Validates the fixed RTP header of a freshly read datagram, advancing the
/// packet's cursors past the header, any CSRC list and extension, and
/// trimming trailing padding. Returns `None` (drop the packet) on any
/// malformation.
fn parse_rtp_header(pkt: &mut BufferedPacket) -> Option<RtpHeader> {
    if pkt.data_size() < 12 {
        return None;
    }
    let mut hdr = pkt.data();
    let word = hdr.get_u32();
    if word & 0xC000_0000 != 0x8000_0000 {
        return None; // version must be 2
    }
    let timestamp = hdr.get_u32();
    let ssrc = hdr.get_u32();
    pkt.skip(12);

    let marker = (word >> 23) & 1 != 0;
    let payload_type = ((word >> 16) & 0x7F) as u8;
    let seq_no = (word & 0xFFFF) as u16;

    let cc = ((word >> 24) & 0xF) as usize;
    if pkt.data_size() < cc * 4 {
        return None;
    }
    pkt.skip(cc * 4);

    if word & 0x1000_0000 != 0 {
        if pkt.data_size() < 4 {
            return None;
        }
        let mut ext = pkt.data();
        let ext_words = (ext.get_u32() & 0xFFFF) as usize;
        pkt.skip(4);
        if pkt.data_size() < ext_words * 4 {
            return None;
        }
        pkt.skip(ext_words * 4);
    }

    if word & 0x2000_0000 != 0 {
        let padding = match pkt.data().last() {
            Some(&p) => p as usize,
            None => return None,
        };
        if pkt.data_size() < padding {
            return None;
        }
        pkt.remove_padding(padding);
    }

    Some(RtpHeader {
        seq_no,
        timestamp,
        ssrc,
        marker,
        payload_type,
    })
}

/// An outstanding frame request: the destination plus the metadata
/// accumulated while assembling the frame.
struct Delivery {
    buf: Vec<u8>,
    max_size: usize,
    truncated: usize,
    loss_preceded: bool,
    seq_no: u16,
    timestamp: u32,
    presentation_time: WallTime,
    synced_via_rtcp: bool,
    marker: bool,
}

impl Delivery {
    fn new(dest: FrameDest) -> Self {
        Delivery {
            buf: dest.buf,
            max_size: dest.max_size,
            truncated: 0,
            loss_preceded: false,
            seq_no: 0,
            timestamp: 0,
            presentation_time: WallTime::default(),
            synced_via_rtcp: false,
            marker: false,
        }
    }

    fn into_frame(self) -> crate::hooks::DeliveredFrame {
        crate::hooks::DeliveredFrame {
            data: self.buf,
            truncated_bytes: self.truncated,
            loss_preceded: self.loss_preceded,
            seq_no: self.seq_no,
            timestamp: self.timestamp,
            presentation_time: self.presentation_time,
            synced_via_rtcp: self.synced_via_rtcp,
            marker: self.marker,
        }
    }
}

enum Action {
    Reject,
    LossBarrier,
    Used { exhausted: bool },
}

/// The receiver-side depacketization engine for one RTP stream.
///
/// Drive it from a single-threaded event loop through three entry points:
/// [`RtpSource::on_readable`] when the transport has data,
/// [`RtpSource::get_next_frame`] when the downstream wants a frame, and
/// [`RtpSource::on_wakeup`] when a delay posted through [`Scheduler`]
/// elapses. All wire-level errors are absorbed (the offending packet is
/// dropped and the event logged); nothing propagates to the caller.
pub struct RtpSource {
    payload_format: u8,
    timestamp_frequency: u32,
    reorder: ReorderBuffer,
    format: Box<dyn PayloadFormat>,
    stats: Box<dyn RecvStats>,
    last_ssrc: Option<u32>,
    frame: FrameBoundaries,
    loss_in_fragmented_frame: bool,
    request: Option<Delivery>,
    parked: Option<crate::hooks::DeliveredFrame>,
    packet_read_in_progress: Option<BufferedPacket>,
    need_delivery: bool,
}

impl RtpSource {
    pub fn new(
        config: SourceConfig,
        format: Box<dyn PayloadFormat>,
        stats: Box<dyn RecvStats>,
    ) -> Self {
        Self::with_packet_factory(config, format, stats, Box::new(DefaultPacketFactory))
    }

    pub fn with_packet_factory(
        config: SourceConfig,
        format: Box<dyn PayloadFormat>,
        stats: Box<dyn RecvStats>,
        factory: Box<dyn PacketFactory>,
    ) -> Self {
        let mut reorder = ReorderBuffer::new(factory);
        reorder.set_threshold_time(config.reordering_threshold_usec);
        RtpSource {
            payload_format: config.payload_format,
            timestamp_frequency: config.timestamp_frequency,
            reorder,
            format,
            stats,
            last_ssrc: None,
            frame: FrameBoundaries::default(),
            loss_in_fragmented_frame: false,
            request: None,
            parked: None,
            packet_read_in_progress: None,
            need_delivery: false,
        }
    }

    /// Adjusts how long the head of the reorder queue waits for a missing
    /// earlier packet.
    pub fn set_packet_reordering_threshold_time(&mut self, usec: u32) {
        self.reorder.set_threshold_time(usec);
    }

    /// True while a requested frame has not yet been handed to the sink.
    pub fn has_outstanding_request(&self) -> bool {
        self.request.is_some() || self.parked.is_some()
    }

    /// Requests that the next complete frame be assembled into `dest`.
    ///
    /// The frame is handed to `sink` once available, which may be during
    /// this very call if enough packets are already queued. At most one
    /// request may be outstanding.
    pub fn get_next_frame(
        &mut self,
        dest: FrameDest,
        sink: &mut dyn FrameSink,
        sched: &mut dyn Scheduler,
    ) -> Result<(), Error> {
        if self.has_outstanding_request() {
            return Err(Error::RequestPending);
        }
        self.request = Some(Delivery::new(dest));
        self.need_delivery = true;
        self.deliver_loop(sink, sched);
        Ok(())
    }

    /// Cancels any outstanding request and discards all buffered state.
    ///
    /// Any already-scheduled wakeup may still fire; it will find nothing to
    /// do.
    pub fn stop_getting_frames(&mut self) {
        self.reorder.reset();
        self.frame = FrameBoundaries::default();
        self.loss_in_fragmented_frame = false;
        self.request = None;
        self.parked = None;
        self.packet_read_in_progress = None;
        self.need_delivery = false;
    }

    /// Reads one datagram (or one piece of one) from `net` and runs the
    /// delivery loop.
    pub fn on_readable(
        &mut self,
        net: &mut dyn NetReader,
        sink: &mut dyn FrameSink,
        sched: &mut dyn Scheduler,
    ) {
        let resuming = self.packet_read_in_progress.is_some();
        let mut pkt = match self.packet_read_in_progress.take() {
            Some(pkt) => pkt,
            None => self.reorder.get_free_packet(),
        };
        match pkt.fill_in_data(net, resuming) {
            Ok(ReadOutcome::Partial { .. }) => {
                self.packet_read_in_progress = Some(pkt);
                return;
            }
            Ok(ReadOutcome::Complete { .. }) => self.accept_packet(pkt),
            Err(e) => {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    trace!("spurious readability event");
                } else {
                    debug!("RTP read failed: {}", e);
                }
                self.reorder.free_packet(pkt);
            }
        }
        self.deliver_loop(sink, sched);
    }

    /// Entry point for wakeups posted through [`Scheduler`]: hands any
    /// parked frame to the sink, then resumes delivery.
    pub fn on_wakeup(&mut self, sink: &mut dyn FrameSink, sched: &mut dyn Scheduler) {
        if let Some(frame) = self.parked.take() {
            if let Some(dest) = sink.after_getting(frame) {
                self.request = Some(Delivery::new(dest));
                self.need_delivery = true;
            }
        }
        self.deliver_loop(sink, sched);
    }

    /// Validates a freshly read datagram and stores it in the reorder
    /// queue. Every failure drops the packet silently (logged only).
    fn accept_packet(&mut self, mut pkt: BufferedPacket) {
        let hdr = match parse_rtp_header(&mut pkt) {
            Some(hdr) => hdr,
            None => {
                debug!("dropping malformed RTP datagram:\n{:?}", pkt.data().hex_dump());
                self.reorder.free_packet(pkt);
                return;
            }
        };
        if hdr.payload_type != self.payload_format {
            debug!(
                "dropping RTP packet with payload type {} while expecting {}",
                hdr.payload_type, self.payload_format
            );
            self.reorder.free_packet(pkt);
            return;
        }
        if self.last_ssrc != Some(hdr.ssrc) {
            // A single-SSRC stream whose SSRC changes occasionally; the next
            // packet re-seeds the expected sequence number.
            if let Some(old) = self.last_ssrc {
                debug!("SSRC changed from {:08x} to {:08x}", old, hdr.ssrc);
            }
            self.last_ssrc = Some(hdr.ssrc);
            self.reorder.reset_have_seen_first_packet();
        }
        let usable = self.format.usable_in_jitter_calculation(pkt.data());
        let timing = self.stats.note_incoming_packet(
            hdr.ssrc,
            hdr.seq_no,
            hdr.timestamp,
            self.timestamp_frequency,
            usable,
            pkt.data_size(),
        );
        pkt.assign_misc_params(
            hdr.seq_no,
            hdr.timestamp,
            timing.presentation_time,
            timing.synced_via_rtcp,
            hdr.marker,
            Instant::now(),
        );
        match self.reorder.store(pkt) {
            StoreOutcome::Stored => {}
            StoreOutcome::Stale => debug!(
                "dropping stale RTP packet seq={:04x} while expecting {:04x}",
                hdr.seq_no,
                self.reorder.next_expected_seq()
            ),
            StoreOutcome::Duplicate => {
                debug!("dropping duplicate RTP packet seq={:04x}", hdr.seq_no)
            }
        }
    }

    /// Drains completed packets into the outstanding request for as long as
    /// progress is possible, assembling fragments and handling loss.
    fn deliver_loop(&mut self, sink: &mut dyn FrameSink, sched: &mut dyn Scheduler) {
        while self.need_delivery {
            let now = Instant::now();
            let action = {
                let d = match self.request.as_mut() {
                    Some(d) => d,
                    None => break,
                };
                let (pkt, loss_preceded) = match self.reorder.next_completed(now) {
                    Some(next) => next,
                    None => break,
                };
                self.need_delivery = false;

                let mut rejected = false;
                if pkt.use_count() == 0 {
                    match self.format.process_special_header(pkt, &mut self.frame) {
                        Some(n) => pkt.skip(n),
                        None => {
                            debug!("payload format rejected packet seq={:04x}", pkt.seq_no());
                            rejected = true;
                        }
                    }
                }
                if rejected {
                    Action::Reject
                } else {
                    if self.frame.begins_frame {
                        if loss_preceded || self.loss_in_fragmented_frame {
                            // We didn't get all of the previous frame; forget
                            // any data already assembled from it.
                            d.buf.clear();
                        }
                        d.loss_preceded = loss_preceded || self.loss_in_fragmented_frame;
                        self.loss_in_fragmented_frame = false;
                    } else if loss_preceded {
                        self.loss_in_fragmented_frame = true;
                    }
                    if self.loss_in_fragmented_frame {
                        Action::LossBarrier
                    } else {
                        let remaining = d.max_size.saturating_sub(d.buf.len());
                        let used = pkt.use_frame(&mut *self.format, &mut d.buf, remaining);
                        if used.bytes_truncated > 0 {
                            d.truncated += used.bytes_truncated;
                        } else {
                            d.truncated = 0;
                        }
                        d.seq_no = used.seq_no;
                        d.timestamp = used.timestamp;
                        d.presentation_time = used.presentation_time;
                        d.synced_via_rtcp = used.synced_via_rtcp;
                        d.marker = used.marker;
                        Action::Used {
                            exhausted: !pkt.has_usable_data(),
                        }
                    }
                }
            };
            match action {
                Action::Reject => {
                    self.reorder.release_used_packet();
                    self.need_delivery = true;
                }
                Action::LossBarrier => {
                    // This packet continues a frame with a hole in it;
                    // nothing before the next frame start is usable.
                    self.reorder.release_used_packet();
                    self.need_delivery = true;
                    break;
                }
                Action::Used { exhausted } => {
                    if exhausted {
                        self.reorder.release_used_packet();
                    }
                    if self.frame.completes_frame {
                        let d = match self.request.take() {
                            Some(d) => d,
                            None => break,
                        };
                        if d.truncated > 0 {
                            warn!(
                                "frame size exceeds the requested maximum of {} bytes; \
                                 {} bytes of trailing data dropped",
                                d.max_size, d.truncated
                            );
                        }
                        let frame = d.into_frame();
                        if self.reorder.is_empty() {
                            match sink.after_getting(frame) {
                                Some(dest) => {
                                    self.request = Some(Delivery::new(dest));
                                    self.need_delivery = true;
                                }
                                None => break,
                            }
                        } else {
                            // More packets are queued; deliver via the event
                            // loop so the sink can't recurse into us without
                            // bound.
                            self.parked = Some(frame);
                            sched.schedule(0);
                            break;
                        }
                    } else {
                        // Fragment delivered; keep assembling the frame.
                        self.need_delivery = true;
                    }
                }
            }
        }
    }
}
