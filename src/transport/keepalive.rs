//! Keepalive pings and the ping-strike defense.
//!
//! The [`PingHandler`] is timer-driven but sans-io: the caller owns the
//! repeating keepalive timer and the one-shot pong timeout, passes `Instant`s
//! in, and performs whatever the handler answers. A missed pong is fatal to
//! the connection; the caller surfaces it to the idle state machine as
//! `shutdown_now`.

use std::time::{Duration, Instant};

use tracing::trace;

/// The opaque payload carried by keepalive PING frames.
pub const KEEPALIVE_PING_DATA: u64 = u64::from_be_bytes(*b"grpcore\0");

/// The payload of the PING following a server-side GOAWAY. Its PONG tells
/// the server the peer saw the GOAWAY, so the last-stream-id can be
/// ratcheted down.
pub const GOAWAY_PING_DATA: u64 = !KEEPALIVE_PING_DATA;

/// The HTTP/2 `ENHANCE_YOUR_CALM` error code, sent when a peer exceeds its
/// ping budget.
pub const ENHANCE_YOUR_CALM: u32 = 0xB;

/// Keepalive configuration.
///
/// `timeout` must be strictly smaller than `interval`.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Time between keepalive pings.
    pub interval: Duration,
    /// How long to wait for the pong before declaring the connection dead.
    pub timeout: Duration,
    /// Whether pings may be sent while no calls are in flight.
    pub permit_without_calls: bool,
    /// How many pings may be sent with no data activity before throttling.
    pub max_pings_without_data: u32,
    /// Minimum spacing between sent pings while there is no data activity.
    pub min_sent_ping_interval_without_data: Duration,
    /// Server: minimum spacing of peer pings before they count as strikes.
    pub min_received_ping_interval_without_data: Duration,
    /// Server: strikes tolerated before `ENHANCE_YOUR_CALM`. Zero disables
    /// the defense.
    pub max_ping_strikes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: Duration::from_secs(2 * 60 * 60),
            timeout: Duration::from_secs(20),
            permit_without_calls: false,
            max_pings_without_data: 2,
            min_sent_ping_interval_without_data: Duration::from_secs(5 * 60),
            min_received_ping_interval_without_data: Duration::from_secs(5 * 60),
            max_ping_strikes: 2,
        }
    }
}

impl KeepaliveConfig {
    /// A config pinging every `interval` with the given pong `timeout`.
    ///
    /// # Panics
    ///
    /// Panics unless `timeout < interval`.
    pub fn new(interval: Duration, timeout: Duration) -> KeepaliveConfig {
        assert!(
            timeout < interval,
            "keepalive timeout ({timeout:?}) must be shorter than the interval ({interval:?})"
        );
        KeepaliveConfig {
            interval,
            timeout,
            ..KeepaliveConfig::default()
        }
    }
}

/// Answer to the keepalive timer firing.
#[derive(Debug, PartialEq, Eq)]
pub enum PingFired {
    /// Write a PING with this payload and arm the pong timeout.
    SendPing {
        /// Opaque PING payload.
        payload: u64,
        /// Arm the pong timeout for this long.
        timeout: Duration,
    },
    /// This tick is throttled; keep the repeating timer running.
    Skip,
}

/// Answer to a PING frame from the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum PingReceived {
    /// A well-behaved ping: acknowledge it.
    Ack {
        /// Payload to echo in the acknowledgement.
        payload: u64,
    },
    /// An abusive ping: a strike was recorded and no ack is sent.
    Strike,
    /// The strike budget is spent: GOAWAY with [`ENHANCE_YOUR_CALM`] and
    /// close the connection.
    EnhanceYourCalm,
}

/// Answer to a PING acknowledgement from the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum PongReceived {
    /// The keepalive pong: cancel the pong timeout.
    CancelTimeout,
    /// The pong correlating a server-side GOAWAY: ratchet the GOAWAY
    /// last-stream-id down (see
    /// [`IdleStateMachine::goaway_ping_acknowledged`]).
    ///
    /// [`IdleStateMachine::goaway_ping_acknowledged`]:
    ///     crate::transport::idle::IdleStateMachine::goaway_ping_acknowledged
    GoAwayAcknowledged,
    /// A pong this side did not send a ping for.
    Unknown,
}

/// Timer-driven producer of keepalive PINGs and server-side ping policeman.
#[derive(Debug)]
pub struct PingHandler {
    config: KeepaliveConfig,
    active_streams: usize,
    /// Whether the repeating keepalive timer was handed to the caller.
    timer_started: bool,
    pings_without_data: u32,
    last_sent_ping: Option<Instant>,
    last_received_ping: Option<Instant>,
    ping_strikes: u32,
}

impl PingHandler {
    /// Create a handler with the given configuration.
    pub fn new(config: KeepaliveConfig) -> PingHandler {
        PingHandler {
            config,
            active_streams: 0,
            timer_started: false,
            pings_without_data: 0,
            last_sent_ping: None,
            last_received_ping: None,
            ping_strikes: 0,
        }
    }

    /// A stream opened. On the first stream ever, returns the interval the
    /// caller must schedule the repeating keepalive timer at.
    pub fn stream_created(&mut self) -> Option<Duration> {
        self.active_streams += 1;
        if !self.timer_started {
            self.timer_started = true;
            return Some(self.config.interval);
        }
        None
    }

    /// A stream finished.
    pub fn stream_closed(&mut self) {
        self.active_streams = self.active_streams.saturating_sub(1);
    }

    /// Data moved on the connection; the without-data throttles reset.
    pub fn data_sent(&mut self) {
        self.pings_without_data = 0;
    }

    /// The repeating keepalive timer fired.
    pub fn ping_fired(&mut self, now: Instant) -> PingFired {
        if self.active_streams == 0 {
            if !self.config.permit_without_calls {
                trace!("skipping keepalive ping: no calls in flight");
                return PingFired::Skip;
            }
            if self.pings_without_data >= self.config.max_pings_without_data {
                trace!("skipping keepalive ping: ping budget without data spent");
                return PingFired::Skip;
            }
            if let Some(last) = self.last_sent_ping {
                if now.duration_since(last) < self.config.min_sent_ping_interval_without_data {
                    trace!("skipping keepalive ping: pinged too recently");
                    return PingFired::Skip;
                }
            }
            self.pings_without_data += 1;
        }

        self.last_sent_ping = Some(now);
        PingFired::SendPing {
            payload: KEEPALIVE_PING_DATA,
            timeout: self.config.timeout,
        }
    }

    /// A PING (not an ack) arrived from the peer. Server-side strike
    /// accounting happens here.
    pub fn ping_received(&mut self, payload: u64, now: Instant) -> PingReceived {
        let since_last = self
            .last_received_ping
            .map(|last| now.duration_since(last));
        self.last_received_ping = Some(now);

        let is_strike = self.active_streams == 0
            && self.config.permit_without_calls
            && since_last
                .is_some_and(|since| since < self.config.min_received_ping_interval_without_data);

        if is_strike && self.config.max_ping_strikes != 0 {
            self.ping_strikes += 1;
            if self.ping_strikes > self.config.max_ping_strikes {
                return PingReceived::EnhanceYourCalm;
            }
            return PingReceived::Strike;
        }

        self.ping_strikes = 0;
        PingReceived::Ack { payload }
    }

    /// A PING acknowledgement arrived from the peer.
    pub fn pong_received(&mut self, payload: u64) -> PongReceived {
        if payload == KEEPALIVE_PING_DATA {
            PongReceived::CancelTimeout
        } else if payload == GOAWAY_PING_DATA {
            PongReceived::GoAwayAcknowledged
        } else {
            trace!(payload, "ignoring unsolicited pong");
            PongReceived::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    fn handler(config: KeepaliveConfig) -> PingHandler {
        PingHandler::new(config)
    }

    #[test]
    #[should_panic(expected = "must be shorter")]
    fn timeout_must_be_shorter_than_interval() {
        KeepaliveConfig::new(Duration::from_secs(1), Duration::from_secs(10));
    }

    #[test]
    fn first_stream_starts_the_timer_once() {
        let mut ping = handler(KeepaliveConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));

        assert_eq!(ping.stream_created(), Some(Duration::from_secs(10)));
        assert_eq!(ping.stream_created(), None);
        ping.stream_closed();
        ping.stream_closed();
        assert_eq!(ping.stream_created(), None);
    }

    #[test]
    fn ping_fires_with_active_streams() {
        let mut ping = handler(KeepaliveConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));
        ping.stream_created();

        let now = Instant::now();
        assert_eq!(
            ping.ping_fired(now),
            PingFired::SendPing {
                payload: KEEPALIVE_PING_DATA,
                timeout: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn idle_connection_without_permit_skips() {
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: false,
            ..KeepaliveConfig::default()
        });
        assert_eq!(ping.ping_fired(Instant::now()), PingFired::Skip);
    }

    #[test]
    fn idle_pings_are_budgeted_and_spaced() {
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: true,
            max_pings_without_data: 2,
            min_sent_ping_interval_without_data: Duration::from_secs(300),
            ..KeepaliveConfig::default()
        });

        let base = Instant::now();
        assert!(matches!(ping.ping_fired(base), PingFired::SendPing { .. }));

        // Too soon.
        assert_eq!(ping.ping_fired(at(base, 10)), PingFired::Skip);

        // Far enough apart, still within budget.
        assert!(matches!(
            ping.ping_fired(at(base, 301)),
            PingFired::SendPing { .. }
        ));

        // Budget of two spent.
        assert_eq!(ping.ping_fired(at(base, 700)), PingFired::Skip);

        // Data activity resets the budget.
        ping.data_sent();
        assert!(matches!(
            ping.ping_fired(at(base, 1100)),
            PingFired::SendPing { .. }
        ));
    }

    #[test]
    fn well_behaved_pings_are_acked_and_reset_strikes() {
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: true,
            min_received_ping_interval_without_data: Duration::from_secs(300),
            max_ping_strikes: 2,
            ..KeepaliveConfig::default()
        });

        let base = Instant::now();
        assert_eq!(
            ping.ping_received(77, base),
            PingReceived::Ack { payload: 77 }
        );
        assert_eq!(ping.ping_received(77, at(base, 1)), PingReceived::Strike);
        // A properly spaced ping resets the count.
        assert_eq!(
            ping.ping_received(77, at(base, 400)),
            PingReceived::Ack { payload: 77 }
        );
        assert_eq!(ping.ping_received(77, at(base, 401)), PingReceived::Strike);
        assert_eq!(ping.ping_received(77, at(base, 402)), PingReceived::Strike);
        assert_eq!(
            ping.ping_received(77, at(base, 403)),
            PingReceived::EnhanceYourCalm
        );
    }

    #[test]
    fn strikes_need_k_plus_one_bad_pings() {
        let strikes = 3u32;
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: true,
            min_received_ping_interval_without_data: Duration::from_secs(300),
            max_ping_strikes: strikes,
            ..KeepaliveConfig::default()
        });

        let base = Instant::now();
        // Prime last_received_ping.
        assert_eq!(
            ping.ping_received(1, base),
            PingReceived::Ack { payload: 1 }
        );

        for i in 0..strikes {
            assert_eq!(
                ping.ping_received(1, at(base, 1 + u64::from(i))),
                PingReceived::Strike
            );
        }
        assert_eq!(
            ping.ping_received(1, at(base, 10)),
            PingReceived::EnhanceYourCalm
        );
    }

    #[test]
    fn pings_with_active_streams_never_strike() {
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: true,
            min_received_ping_interval_without_data: Duration::from_secs(300),
            max_ping_strikes: 1,
            ..KeepaliveConfig::default()
        });
        ping.stream_created();

        let base = Instant::now();
        for i in 0..10 {
            assert_eq!(
                ping.ping_received(5, at(base, i)),
                PingReceived::Ack { payload: 5 }
            );
        }
    }

    #[test]
    fn zero_max_strikes_disables_the_defense() {
        let mut ping = handler(KeepaliveConfig {
            permit_without_calls: true,
            min_received_ping_interval_without_data: Duration::from_secs(300),
            max_ping_strikes: 0,
            ..KeepaliveConfig::default()
        });

        let base = Instant::now();
        for i in 0..10 {
            assert_eq!(
                ping.ping_received(5, at(base, i)),
                PingReceived::Ack { payload: 5 }
            );
        }
    }

    #[test]
    fn pongs_are_correlated_by_payload() {
        let mut ping = handler(KeepaliveConfig::default());
        assert_eq!(
            ping.pong_received(KEEPALIVE_PING_DATA),
            PongReceived::CancelTimeout
        );
        assert_eq!(
            ping.pong_received(GOAWAY_PING_DATA),
            PongReceived::GoAwayAcknowledged
        );
        assert_eq!(ping.pong_received(42), PongReceived::Unknown);
    }

    #[test]
    fn goaway_payload_is_the_complement() {
        assert_eq!(GOAWAY_PING_DATA, !KEEPALIVE_PING_DATA);
        assert_ne!(GOAWAY_PING_DATA, KEEPALIVE_PING_DATA);
    }
}
