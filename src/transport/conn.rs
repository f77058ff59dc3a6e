//! The per-connection event translator.
//!
//! [`ConnectionDriver`] composes the [`idle`](crate::transport::idle) state
//! machine and the [`keepalive`](crate::transport::keepalive) ping handler
//! into one sans-io unit: the connection's event loop feeds it every
//! connection-level HTTP/2 event and timer fire, and performs the
//! [`ConnActions`] it answers with. Per-stream frames never pass through
//! here; those belong to the RPC state machines.

use std::time::{Duration, Instant};

use tracing::trace;

use super::{
    idle::{GoAway, IdleStateMachine, ManagerEvent, Operations, Role, TimerOp},
    keepalive::{
        KeepaliveConfig, PingFired, PingHandler, PingReceived, PongReceived, GOAWAY_PING_DATA,
    },
};

/// A connection-level HTTP/2 event.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionEvent {
    /// A SETTINGS frame arrived.
    SettingsReceived {
        /// `SETTINGS_MAX_CONCURRENT_STREAMS`, when present.
        max_concurrent_streams: Option<u32>,
    },
    /// An HTTP/2 stream was created.
    StreamOpened {
        /// The new stream's identifier.
        stream_id: u32,
    },
    /// An HTTP/2 stream finished (closed or reset).
    StreamClosed {
        /// The finished stream's identifier.
        stream_id: u32,
    },
    /// A PING frame (or its acknowledgement) arrived.
    PingReceived {
        /// The opaque ping payload.
        payload: u64,
        /// Whether the ACK flag was set.
        ack: bool,
    },
    /// The peer sent GOAWAY.
    GoAwayReceived,
    /// DATA moved on the connection in either direction.
    DataActivity,
    /// The transport reported the connection gone.
    ChannelInactive,
}

/// A connection-level frame to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnFrame {
    /// A PING frame.
    Ping {
        /// Opaque payload.
        payload: u64,
        /// Whether this is an acknowledgement.
        ack: bool,
    },
    /// A GOAWAY frame.
    GoAway(GoAway),
}

/// Everything the event loop must do after one event, in field order:
/// notify the manager, adjust timers, write frames, then close the channel.
#[derive(Debug, Default)]
pub struct ConnActions {
    /// Manager notification to deliver first.
    pub notify: Option<ManagerEvent>,
    /// Idle timer instruction.
    pub idle_timer: Option<TimerOp>,
    /// Start the repeating keepalive timer at this interval.
    pub start_keepalive: Option<Duration>,
    /// Arm the one-shot pong timeout for this long.
    pub arm_pong_timeout: Option<Duration>,
    /// Cancel the armed pong timeout.
    pub cancel_pong_timeout: bool,
    /// Frames to write, in order.
    pub frames: Vec<ConnFrame>,
    /// Close the channel last.
    pub close_channel: bool,
}

impl ConnActions {
    /// Whether this aggregate carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.notify.is_none()
            && self.idle_timer.is_none()
            && self.start_keepalive.is_none()
            && self.arm_pong_timeout.is_none()
            && !self.cancel_pong_timeout
            && self.frames.is_empty()
            && !self.close_channel
    }

    fn absorb(&mut self, ops: Operations) {
        if ops.notify.is_some() {
            self.notify = ops.notify;
        }
        if ops.idle_timer.is_some() {
            self.idle_timer = ops.idle_timer;
        }
        if let Some(goaway) = ops.goaway {
            self.frames.push(ConnFrame::GoAway(goaway));
        }
        if ops.ping_after_goaway {
            self.frames.push(ConnFrame::Ping {
                payload: GOAWAY_PING_DATA,
                ack: false,
            });
        }
        self.close_channel |= ops.close_channel;
    }
}

/// Composes the idle/quiescing machine and the keepalive handler for one
/// connection.
#[derive(Debug)]
pub struct ConnectionDriver {
    idle: IdleStateMachine,
    ping: PingHandler,
}

impl ConnectionDriver {
    /// A driver for a fresh connection.
    pub fn new(role: Role, keepalive: KeepaliveConfig) -> ConnectionDriver {
        ConnectionDriver {
            idle: IdleStateMachine::new(role),
            ping: PingHandler::new(keepalive),
        }
    }

    /// The peer's advertised concurrency bound.
    pub fn max_concurrent_streams(&self) -> u32 {
        self.idle.max_concurrent_streams()
    }

    /// Process one connection-level event.
    pub fn handle(&mut self, event: ConnectionEvent, now: Instant) -> ConnActions {
        let mut actions = ConnActions::default();

        match event {
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams,
            } => {
                actions.absorb(self.idle.settings_received(max_concurrent_streams));
            }
            ConnectionEvent::StreamOpened { stream_id } => {
                actions.absorb(self.idle.stream_created(stream_id));
                actions.start_keepalive = self.ping.stream_created();
            }
            ConnectionEvent::StreamClosed { stream_id } => {
                actions.absorb(self.idle.stream_closed(stream_id));
                self.ping.stream_closed();
            }
            ConnectionEvent::PingReceived { payload, ack: false } => {
                match self.ping.ping_received(payload, now) {
                    PingReceived::Ack { payload } => {
                        actions.frames.push(ConnFrame::Ping { payload, ack: true });
                    }
                    PingReceived::Strike => {
                        trace!("recorded ping strike");
                    }
                    PingReceived::EnhanceYourCalm => {
                        actions.absorb(self.idle.shutdown_now(true));
                    }
                }
            }
            ConnectionEvent::PingReceived { payload, ack: true } => {
                match self.ping.pong_received(payload) {
                    PongReceived::CancelTimeout => actions.cancel_pong_timeout = true,
                    PongReceived::GoAwayAcknowledged => {
                        actions.absorb(self.idle.goaway_ping_acknowledged());
                    }
                    PongReceived::Unknown => {}
                }
            }
            ConnectionEvent::GoAwayReceived => {
                actions.absorb(self.idle.goaway_received());
            }
            ConnectionEvent::DataActivity => {
                self.ping.data_sent();
            }
            ConnectionEvent::ChannelInactive => {
                actions.absorb(self.idle.channel_inactive());
            }
        }

        actions
    }

    /// The event loop armed the idle timer the driver asked for.
    pub fn idle_timer_scheduled(&mut self) -> ConnActions {
        let mut actions = ConnActions::default();
        actions.absorb(self.idle.idle_task_scheduled());
        actions
    }

    /// The idle timer fired.
    pub fn idle_timer_fired(&mut self) -> ConnActions {
        let mut actions = ConnActions::default();
        actions.absorb(self.idle.idle_timeout_fired());
        actions
    }

    /// The repeating keepalive timer fired.
    pub fn keepalive_timer_fired(&mut self, now: Instant) -> ConnActions {
        let mut actions = ConnActions::default();
        match self.ping.ping_fired(now) {
            PingFired::SendPing { payload, timeout } => {
                actions.frames.push(ConnFrame::Ping { payload, ack: false });
                actions.arm_pong_timeout = Some(timeout);
            }
            PingFired::Skip => {}
        }
        actions
    }

    /// The pong timeout fired: the peer is unresponsive and the connection
    /// is torn down immediately.
    pub fn pong_timeout_fired(&mut self) -> ConnActions {
        let mut actions = ConnActions::default();
        actions.absorb(self.idle.shutdown_now(false));
        actions
    }

    /// Begin a locally-initiated graceful shutdown.
    pub fn initiate_graceful_shutdown(&mut self) -> ConnActions {
        let mut actions = ConnActions::default();
        actions.absorb(self.idle.initiate_graceful_shutdown());
        actions
    }

    /// Tear the connection down immediately, abandoning open streams.
    pub fn shutdown_now(&mut self) -> ConnActions {
        let mut actions = ConnActions::default();
        actions.absorb(self.idle.shutdown_now(false));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::idle::MAX_STREAM_ID;
    use crate::transport::keepalive::KEEPALIVE_PING_DATA;

    fn server_driver() -> ConnectionDriver {
        ConnectionDriver::new(
            Role::Server,
            KeepaliveConfig {
                permit_without_calls: true,
                min_received_ping_interval_without_data: Duration::from_secs(300),
                max_ping_strikes: 2,
                ..KeepaliveConfig::default()
            },
        )
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn settings_then_first_stream_starts_keepalive() {
        let mut driver = ConnectionDriver::new(
            Role::Client,
            KeepaliveConfig::new(Duration::from_secs(10), Duration::from_secs(1)),
        );

        let actions = driver.handle(
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams: Some(64),
            },
            now(),
        );
        assert_eq!(actions.notify, Some(ManagerEvent::Ready));
        assert_eq!(driver.max_concurrent_streams(), 64);

        let actions = driver.handle(ConnectionEvent::StreamOpened { stream_id: 1 }, now());
        assert_eq!(actions.start_keepalive, Some(Duration::from_secs(10)));

        // Second stream does not restart the timer.
        let actions = driver.handle(ConnectionEvent::StreamOpened { stream_id: 3 }, now());
        assert!(actions.start_keepalive.is_none());
    }

    #[test]
    fn keepalive_round_trip_arms_and_cancels_the_pong_timeout() {
        let mut driver = ConnectionDriver::new(
            Role::Client,
            KeepaliveConfig::new(Duration::from_secs(10), Duration::from_secs(1)),
        );
        driver.handle(
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams: None,
            },
            now(),
        );
        driver.handle(ConnectionEvent::StreamOpened { stream_id: 1 }, now());

        let actions = driver.keepalive_timer_fired(now());
        assert_eq!(
            actions.frames,
            vec![ConnFrame::Ping {
                payload: KEEPALIVE_PING_DATA,
                ack: false
            }]
        );
        assert_eq!(actions.arm_pong_timeout, Some(Duration::from_secs(1)));

        let actions = driver.handle(
            ConnectionEvent::PingReceived {
                payload: KEEPALIVE_PING_DATA,
                ack: true,
            },
            now(),
        );
        assert!(actions.cancel_pong_timeout);
    }

    #[test]
    fn missed_pong_tears_the_connection_down() {
        let mut driver = ConnectionDriver::new(
            Role::Client,
            KeepaliveConfig::new(Duration::from_secs(10), Duration::from_secs(1)),
        );
        driver.handle(
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams: None,
            },
            now(),
        );
        driver.handle(ConnectionEvent::StreamOpened { stream_id: 1 }, now());
        driver.keepalive_timer_fired(now());

        let actions = driver.pong_timeout_fired();
        assert!(matches!(actions.frames[..], [ConnFrame::GoAway(_)]));
        assert!(actions.close_channel);

        let actions = driver.handle(ConnectionEvent::ChannelInactive, now());
        assert_eq!(actions.notify, Some(ManagerEvent::Inactive));
    }

    #[test]
    fn well_behaved_ping_is_acked() {
        let mut driver = server_driver();
        let actions = driver.handle(
            ConnectionEvent::PingReceived {
                payload: 7,
                ack: false,
            },
            now(),
        );
        assert_eq!(actions.frames, vec![ConnFrame::Ping { payload: 7, ack: true }]);
    }

    #[test]
    fn ping_flood_earns_enhance_your_calm() {
        let mut driver = server_driver();
        let base = now();

        let mut goaway = None;
        for i in 0..10u64 {
            let actions = driver.handle(
                ConnectionEvent::PingReceived {
                    payload: i,
                    ack: false,
                },
                base + Duration::from_millis(i),
            );
            if let Some(ConnFrame::GoAway(frame)) = actions.frames.first() {
                goaway = Some(*frame);
                assert!(actions.close_channel);
                break;
            }
        }

        let goaway = goaway.expect("the flood must trigger a GOAWAY");
        assert!(goaway.enhance_your_calm);
    }

    #[test]
    fn data_activity_resets_the_ping_budget() {
        let mut driver = ConnectionDriver::new(
            Role::Client,
            KeepaliveConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(1),
                permit_without_calls: true,
                max_pings_without_data: 1,
                min_sent_ping_interval_without_data: Duration::from_millis(0),
                ..KeepaliveConfig::default()
            },
        );

        let base = now();
        assert!(!driver.keepalive_timer_fired(base).is_empty());
        // Budget of one without data is spent.
        assert!(driver
            .keepalive_timer_fired(base + Duration::from_secs(1))
            .is_empty());

        driver.handle(ConnectionEvent::DataActivity, base);
        assert!(!driver
            .keepalive_timer_fired(base + Duration::from_secs(2))
            .is_empty());
    }

    #[test]
    fn server_answers_goaway_with_goaway_and_correlation_ping() {
        let mut driver = server_driver();
        driver.handle(
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams: None,
            },
            now(),
        );
        driver.handle(ConnectionEvent::StreamOpened { stream_id: 1 }, now());

        let actions = driver.handle(ConnectionEvent::GoAwayReceived, now());
        assert_eq!(actions.notify, Some(ManagerEvent::Quiescing));
        assert_eq!(
            actions.frames,
            vec![
                ConnFrame::GoAway(GoAway {
                    last_peer_stream_id: MAX_STREAM_ID,
                    enhance_your_calm: false,
                }),
                ConnFrame::Ping {
                    payload: GOAWAY_PING_DATA,
                    ack: false,
                },
            ]
        );

        // The correlation pong ratchets the GOAWAY down.
        let actions = driver.handle(
            ConnectionEvent::PingReceived {
                payload: GOAWAY_PING_DATA,
                ack: true,
            },
            now(),
        );
        assert_eq!(
            actions.frames,
            vec![ConnFrame::GoAway(GoAway {
                last_peer_stream_id: 1,
                enhance_your_calm: false,
            })]
        );

        // Draining the last stream closes the connection.
        let actions = driver.handle(ConnectionEvent::StreamClosed { stream_id: 1 }, now());
        assert!(actions.close_channel);
    }

    #[test]
    fn idle_cycle_through_the_driver() {
        let mut driver = ConnectionDriver::new(Role::Client, KeepaliveConfig::default());

        let actions = driver.handle(
            ConnectionEvent::SettingsReceived {
                max_concurrent_streams: None,
            },
            now(),
        );
        assert_eq!(actions.idle_timer, Some(TimerOp::Schedule));
        assert!(driver.idle_timer_scheduled().is_empty());

        let actions = driver.idle_timer_fired();
        assert!(actions.close_channel);

        let actions = driver.handle(ConnectionEvent::ChannelInactive, now());
        assert_eq!(actions.notify, Some(ManagerEvent::Idle));
    }
}
