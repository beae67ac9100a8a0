// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feeds arbitrary datagrams through the read/parse/reorder/deliver path.

#![no_main]

use std::collections::VecDeque;
use std::io;

use libfuzzer_sys::fuzz_target;

use deframe::hooks::{
    DefaultFormat, DeliveredFrame, FrameDest, FrameSink, NetReader, ReadOutcome, Scheduler,
    SystemClockStats,
};
use deframe::source::{RtpSource, SourceConfig};

struct QueueReader(VecDeque<Vec<u8>>);

impl NetReader for QueueReader {
    fn handle_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.0.pop_front() {
            Some(d) => {
                let len = d.len().min(buf.len());
                buf[..len].copy_from_slice(&d[..len]);
                Ok(ReadOutcome::Complete {
                    len,
                    from: "127.0.0.1:5004".parse().unwrap(),
                })
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

struct GreedySink;

impl FrameSink for GreedySink {
    fn after_getting(&mut self, frame: DeliveredFrame) -> Option<FrameDest> {
        Some(FrameDest::new(frame.data, 1500))
    }
}

struct NullScheduler;

impl Scheduler for NullScheduler {
    fn schedule(&mut self, _delay_usec: u64) {}
}

fuzz_target!(|data: &[u8]| {
    // First byte picks the expected payload type; the rest is split into
    // length-prefixed datagrams.
    let (&pt, mut rest) = match data.split_first() {
        Some(x) => x,
        None => return,
    };
    let mut datagrams = VecDeque::new();
    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len).min(tail.len());
        datagrams.push_back(tail[..len].to_vec());
        rest = &tail[len..];
    }
    let count = datagrams.len();

    let mut src = RtpSource::new(
        SourceConfig::new(pt & 0x7F, 90_000),
        Box::new(DefaultFormat::default()),
        Box::new(SystemClockStats::default()),
    );
    src.set_packet_reordering_threshold_time(0);
    let mut net = QueueReader(datagrams);
    let mut sink = GreedySink;
    let mut sched = NullScheduler;
    if src
        .get_next_frame(FrameDest::new(Vec::new(), 1500), &mut sink, &mut sched)
        .is_err()
    {
        return;
    }
    for _ in 0..count {
        src.on_readable(&mut net, &mut sink, &mut sched);
        src.on_wakeup(&mut sink, &mut sched);
    }
    src.stop_getting_frames();
});
