// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receiver-side RTP depacketization; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! This crate handles the payload formats that pack one or more complete
//! codec frames into each RTP packet (and, symmetrically, that may fragment
//! one frame across several packets). [`source::RtpSource`] parses incoming
//! datagrams, reorders out-of-sequence packets within a bounded time window,
//! detects loss and duplication, and hands complete in-order frames to a
//! downstream [`hooks::FrameSink`].
//!
//! Socket I/O, deferred task scheduling, reception statistics, and
//! payload-format-specific rules are all supplied by the caller through the
//! traits in [`hooks`]; [`net`] provides a ready-made UDP reader and drive
//! loop on tokio.

pub mod hooks;
pub mod net;
pub mod pkt;
mod reorder;
pub mod source;

/// A wall-clock instant as a `(seconds, microseconds)` pair since the
/// Unix epoch, as RTP presentation times are conventionally expressed.
///
/// Invariant: `usec < 1_000_000`.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct WallTime {
    pub sec: u64,
    pub usec: u32,
}

impl WallTime {
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => WallTime {
                sec: d.as_secs(),
                usec: d.subsec_micros(),
            },
            Err(_) => WallTime::default(),
        }
    }

    /// Advances this time by `usec` microseconds, carrying into seconds.
    pub fn add_usec(&mut self, usec: u32) {
        let total = u64::from(self.usec) + u64::from(usec);
        self.sec += total / 1_000_000;
        self.usec = (total % 1_000_000) as u32;
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame was requested while another request was outstanding.
    ///
    /// [`source::RtpSource::get_next_frame`] must not be called again until
    /// the previous request has been answered through
    /// [`hooks::FrameSink::after_getting`].
    #[error("a frame request is already outstanding")]
    RequestPending,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::WallTime;

    #[test]
    fn walltime_carry() {
        let mut t = WallTime {
            sec: 10,
            usec: 999_999,
        };
        t.add_usec(1);
        assert_eq!(
            t,
            WallTime {
                sec: 11,
                usec: 0
            }
        );
        t.add_usec(2_500_000);
        assert_eq!(
            t,
            WallTime {
                sec: 13,
                usec: 500_000
            }
        );
        t.add_usec(0);
        assert_eq!(
            t,
            WallTime {
                sec: 13,
                usec: 500_000
            }
        );
    }

    #[test]
    fn walltime_large_advance() {
        let mut t = WallTime { sec: 0, usec: 0 };
        t.add_usec(u32::MAX);
        assert_eq!(
            t,
            WallTime {
                sec: 4294,
                usec: 967_295
            }
        );
    }

    #[test]
    fn walltime_display() {
        let t = WallTime {
            sec: 5,
            usec: 42,
        };
        assert_eq!(t.to_string(), "5.000042");
    }
}
