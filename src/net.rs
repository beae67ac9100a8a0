// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP transport and a tokio drive loop for [`RtpSource`].

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::warn;

use crate::hooks::{FrameDest, FrameSink, NetReader, ReadOutcome, Scheduler};
use crate::source::RtpSource;
use crate::Error;

/// Target kernel receive-buffer size. RTP bursts arrive faster than a busy
/// process drains them; the OS default is often too small.
const RECV_BUFFER_SIZE: usize = 50 * 1024;

/// A [`NetReader`] over a tokio UDP socket.
pub struct UdpNetReader {
    socket: tokio::net::UdpSocket,
}

impl UdpNetReader {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        if let Err(e) = socket2::SockRef::from(&socket).set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!(
                "couldn't set receive buffer to {} bytes: {}",
                RECV_BUFFER_SIZE, e
            );
        }
        Ok(UdpNetReader { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &tokio::net::UdpSocket {
        &self.socket
    }
}

impl NetReader for UdpNetReader {
    fn handle_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let (len, from) = self.socket.try_recv_from(buf)?;
        Ok(ReadOutcome::Complete { len, from })
    }
}

/// Collapses posted delays into the soonest pending wakeup.
#[derive(Default)]
struct LoopScheduler {
    wakeup_at: Option<Instant>,
}

impl Scheduler for LoopScheduler {
    fn schedule(&mut self, delay_usec: u64) {
        let at = Instant::now() + Duration::from_micros(delay_usec);
        self.wakeup_at = Some(match self.wakeup_at {
            Some(cur) if cur <= at => cur,
            _ => at,
        });
    }
}

enum Wake {
    Readable,
    Timer,
}

/// Drives `source` from `net`, requesting frames into `dest` and handing
/// them to `sink`, until the sink declines a further frame (or
/// [`RtpSource::stop_getting_frames`] is called from within it).
pub async fn run(
    source: &mut RtpSource,
    net: &mut UdpNetReader,
    sink: &mut dyn FrameSink,
    dest: FrameDest,
) -> Result<(), Error> {
    let mut sched = LoopScheduler::default();
    source.get_next_frame(dest, sink, &mut sched)?;
    while source.has_outstanding_request() {
        let wake = match sched.wakeup_at.take() {
            Some(at) => {
                tokio::select! {
                    r = net.socket.readable() => {
                        r?;
                        // Not consumed this turn; keep the wakeup pending.
                        sched.wakeup_at = Some(at);
                        Wake::Readable
                    }
                    _ = tokio::time::sleep_until(at.into()) => Wake::Timer,
                }
            }
            None => {
                net.socket.readable().await?;
                Wake::Readable
            }
        };
        match wake {
            Wake::Readable => source.on_readable(net, sink, &mut sched),
            Wake::Timer => source.on_wakeup(sink, &mut sched),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{DefaultFormat, DeliveredFrame, SystemClockStats};
    use crate::source::SourceConfig;

    struct OneFrameSink(Vec<DeliveredFrame>);

    impl FrameSink for OneFrameSink {
        fn after_getting(&mut self, frame: DeliveredFrame) -> Option<FrameDest> {
            self.0.push(frame);
            None
        }
    }

    #[tokio::test]
    async fn delivers_from_real_socket() {
        let mut net = UdpNetReader::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dest_addr = net.local_addr().unwrap();

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        // V=2, PT=96, seq 1, ts 0, ssrc 7, payload "ping".
        let mut datagram = vec![0x80, 0x60, 0x00, 0x01];
        datagram.extend_from_slice(&0u32.to_be_bytes());
        datagram.extend_from_slice(&7u32.to_be_bytes());
        datagram.extend_from_slice(b"ping");
        sender.send_to(&datagram, dest_addr).await.unwrap();

        let mut source = RtpSource::new(
            SourceConfig::new(96, 90_000),
            Box::new(DefaultFormat::default()),
            Box::new(SystemClockStats::default()),
        );
        let mut sink = OneFrameSink(Vec::new());
        run(
            &mut source,
            &mut net,
            &mut sink,
            FrameDest::new(Vec::new(), 1500),
        )
        .await
        .unwrap();

        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].data, b"ping");
        assert_eq!(sink.0[0].seq_no, 1);
        assert!(sink.0[0].loss_preceded);
    }
}
