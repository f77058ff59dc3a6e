//! Per-connection idle and quiescing tracking.
//!
//! One [`IdleStateMachine`] lives on each connection's event loop. It is fed
//! connection-level HTTP/2 events (SETTINGS, stream opens and closes,
//! GOAWAY) and timer confirmations, and answers each with an [`Operations`]
//! aggregate describing what the caller must do: notify the connection
//! manager, arm or cancel the idle timer, write GOAWAY or PING frames, or
//! close the channel.

use tracing::{debug, trace};

/// The highest stream identifier: a GOAWAY carrying it promises to process
/// everything the peer already started.
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Streams a peer may run concurrently when the first SETTINGS does not say.
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Which side of the connection this machine sits on.
///
/// Servers answer a shutdown with the double-GOAWAY pattern; clients do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connection was initiated by us.
    Client,
    /// The connection was accepted by us.
    Server,
}

/// Notifications surfaced to the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The first SETTINGS arrived; the connection is usable.
    Ready,
    /// Graceful shutdown began; existing streams run to completion.
    Quiescing,
    /// The connection went away after idling: reconnect lazily.
    Idle,
    /// The connection went away while it was still wanted.
    Inactive,
}

/// Idle timer instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    /// Arm the idle timer.
    Schedule,
    /// Cancel the armed idle timer.
    Cancel,
}

/// A GOAWAY frame to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAway {
    /// The `last-stream-id` to carry. Across multiple GOAWAYs on one
    /// connection this value never increases.
    pub last_peer_stream_id: u32,
    /// Close the connection with `ENHANCE_YOUR_CALM` instead of `NO_ERROR`.
    pub enhance_your_calm: bool,
}

/// What the caller must do after an event, in field order: notify the
/// manager, adjust the idle timer, write frames, then close the channel.
#[derive(Debug, Default)]
pub struct Operations {
    /// Manager notification to deliver first.
    pub notify: Option<ManagerEvent>,
    /// Idle timer instruction.
    pub idle_timer: Option<TimerOp>,
    /// GOAWAY frame to write.
    pub goaway: Option<GoAway>,
    /// Follow the GOAWAY with the shutdown-correlation PING
    /// ([`GOAWAY_PING_DATA`](crate::transport::keepalive::GOAWAY_PING_DATA)).
    pub ping_after_goaway: bool,
    /// Close the channel last.
    pub close_channel: bool,
}

impl Operations {
    fn none() -> Operations {
        Operations::default()
    }

    /// Whether this aggregate carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.notify.is_none()
            && self.idle_timer.is_none()
            && self.goaway.is_none()
            && !self.ping_after_goaway
            && !self.close_channel
    }
}

/// The connection's idle/quiescing state machine.
pub struct IdleStateMachine {
    role: Role,
    state: State,
}

#[derive(Debug)]
enum State {
    Operating(Tracking),
    /// No open streams; the idle timer is armed.
    WaitingToIdle(Tracking),
    Quiescing(QuiescingState),
    /// A GOAWAY went out and the channel is being torn down.
    Closing(ClosingState),
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Tracking {
    open_streams: usize,
    last_peer_stream_id: u32,
    seen_settings: bool,
    max_concurrent_streams: u32,
}

impl Tracking {
    fn new() -> Tracking {
        Tracking {
            open_streams: 0,
            last_peer_stream_id: 0,
            seen_settings: false,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QuiescingState {
    tracking: Tracking,
    initiated_by_us: bool,
    /// Last-stream-id already promised in a GOAWAY; later GOAWAYs ratchet
    /// down from here, never up.
    goaway_watermark: u32,
}

#[derive(Debug, Clone, Copy)]
struct ClosingState {
    should_idle: bool,
    initiated_by_us: bool,
    tracking: Tracking,
}

impl IdleStateMachine {
    /// A machine for a fresh connection.
    pub fn new(role: Role) -> IdleStateMachine {
        IdleStateMachine {
            role,
            state: State::Operating(Tracking::new()),
        }
    }

    /// The peer's advertised concurrency bound.
    pub fn max_concurrent_streams(&self) -> u32 {
        match &self.state {
            State::Operating(t) | State::WaitingToIdle(t) => t.max_concurrent_streams,
            State::Quiescing(q) => q.tracking.max_concurrent_streams,
            State::Closing(c) => c.tracking.max_concurrent_streams,
            State::Closed => DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }

    fn is_peer_initiated(&self, stream_id: u32) -> bool {
        match self.role {
            // Clients initiate odd stream ids.
            Role::Server => stream_id % 2 == 1,
            Role::Client => stream_id != 0 && stream_id % 2 == 0,
        }
    }

    /// An HTTP/2 stream was created.
    pub fn stream_created(&mut self, stream_id: u32) -> Operations {
        let peer = self.is_peer_initiated(stream_id);
        let mut ops = Operations::none();
        match &mut self.state {
            State::Operating(t) => {
                t.open_streams += 1;
                if peer {
                    t.last_peer_stream_id = t.last_peer_stream_id.max(stream_id);
                }
            }
            State::WaitingToIdle(t) => {
                let mut t = *t;
                t.open_streams += 1;
                if peer {
                    t.last_peer_stream_id = t.last_peer_stream_id.max(stream_id);
                }
                ops.idle_timer = Some(TimerOp::Cancel);
                self.state = State::Operating(t);
            }
            State::Quiescing(q) => {
                // Streams racing the GOAWAY still have to be drained.
                q.tracking.open_streams += 1;
                if peer {
                    q.tracking.last_peer_stream_id =
                        q.tracking.last_peer_stream_id.max(stream_id);
                }
            }
            State::Closing(_) | State::Closed => {}
        }
        ops
    }

    /// An HTTP/2 stream finished (closed or reset).
    pub fn stream_closed(&mut self, stream_id: u32) -> Operations {
        trace!(stream_id, "stream closed");
        let mut ops = Operations::none();
        match &mut self.state {
            State::Operating(t) => {
                t.open_streams = t.open_streams.saturating_sub(1);
                if t.seen_settings && t.open_streams == 0 {
                    ops.idle_timer = Some(TimerOp::Schedule);
                }
            }
            State::Quiescing(q) => {
                q.tracking.open_streams = q.tracking.open_streams.saturating_sub(1);
                if q.tracking.open_streams == 0 {
                    let q = *q;
                    ops.goaway = Some(GoAway {
                        last_peer_stream_id: q
                            .goaway_watermark
                            .min(q.tracking.last_peer_stream_id),
                        enhance_your_calm: false,
                    });
                    ops.close_channel = true;
                    self.state = State::Closing(ClosingState {
                        should_idle: false,
                        initiated_by_us: q.initiated_by_us,
                        tracking: q.tracking,
                    });
                }
            }
            State::WaitingToIdle(_) | State::Closing(_) | State::Closed => {}
        }
        ops
    }

    /// The caller armed the idle timer the machine asked for.
    ///
    /// If anything changed in the meantime the timer is cancelled right
    /// back.
    pub fn idle_task_scheduled(&mut self) -> Operations {
        let mut ops = Operations::none();
        match &self.state {
            State::Operating(t) if t.open_streams == 0 && t.seen_settings => {
                self.state = State::WaitingToIdle(*t);
            }
            _ => {
                ops.idle_timer = Some(TimerOp::Cancel);
            }
        }
        ops
    }

    /// The idle timer fired.
    pub fn idle_timeout_fired(&mut self) -> Operations {
        let mut ops = Operations::none();
        match &self.state {
            State::WaitingToIdle(t) => {
                let t = *t;
                ops.goaway = Some(GoAway {
                    last_peer_stream_id: t.last_peer_stream_id,
                    enhance_your_calm: false,
                });
                ops.close_channel = true;
                self.state = State::Closing(ClosingState {
                    should_idle: true,
                    initiated_by_us: true,
                    tracking: t,
                });
            }
            // A stream was created between the fire and this event.
            _ => debug!("ignoring idle timeout outside waiting-to-idle"),
        }
        ops
    }

    /// A SETTINGS frame arrived.
    pub fn settings_received(&mut self, max_concurrent_streams: Option<u32>) -> Operations {
        let mut ops = Operations::none();
        match &mut self.state {
            State::Operating(t) => {
                if !t.seen_settings {
                    t.seen_settings = true;
                    t.max_concurrent_streams =
                        max_concurrent_streams.unwrap_or(DEFAULT_MAX_CONCURRENT_STREAMS);
                    ops.notify = Some(ManagerEvent::Ready);
                    if t.open_streams == 0 {
                        ops.idle_timer = Some(TimerOp::Schedule);
                    }
                } else if let Some(max) = max_concurrent_streams {
                    t.max_concurrent_streams = max;
                }
            }
            State::WaitingToIdle(t) => {
                if let Some(max) = max_concurrent_streams {
                    t.max_concurrent_streams = max;
                }
            }
            State::Quiescing(q) => {
                if let Some(max) = max_concurrent_streams {
                    q.tracking.max_concurrent_streams = max;
                }
            }
            State::Closing(_) | State::Closed => {}
        }
        ops
    }

    /// The peer sent GOAWAY.
    pub fn goaway_received(&mut self) -> Operations {
        let mut ops = Operations::none();
        match &self.state {
            State::Operating(t) if t.open_streams > 0 => {
                let t = *t;
                ops.notify = Some(ManagerEvent::Quiescing);
                if self.role == Role::Server {
                    // Promise to drain everything, then ratchet down once
                    // the correlation PONG comes back.
                    ops.goaway = Some(GoAway {
                        last_peer_stream_id: MAX_STREAM_ID,
                        enhance_your_calm: false,
                    });
                    ops.ping_after_goaway = true;
                }
                self.state = State::Quiescing(QuiescingState {
                    tracking: t,
                    initiated_by_us: false,
                    goaway_watermark: MAX_STREAM_ID,
                });
            }
            State::Operating(t) => {
                let t = *t;
                ops.close_channel = true;
                self.state = State::Closing(ClosingState {
                    should_idle: false,
                    initiated_by_us: false,
                    tracking: t,
                });
            }
            State::WaitingToIdle(t) => {
                let t = *t;
                ops.idle_timer = Some(TimerOp::Cancel);
                ops.close_channel = true;
                self.state = State::Closing(ClosingState {
                    should_idle: false,
                    initiated_by_us: false,
                    tracking: t,
                });
            }
            State::Quiescing(_) | State::Closing(_) | State::Closed => {}
        }
        ops
    }

    /// The PONG correlating a server-side GOAWAY came back: ratchet the
    /// promised last-stream-id down to what was actually started.
    pub fn goaway_ping_acknowledged(&mut self) -> Operations {
        let mut ops = Operations::none();
        if let State::Quiescing(q) = &mut self.state {
            let last = q.goaway_watermark.min(q.tracking.last_peer_stream_id);
            q.goaway_watermark = last;
            ops.goaway = Some(GoAway {
                last_peer_stream_id: last,
                enhance_your_calm: false,
            });
        }
        ops
    }

    /// Begin a locally-initiated graceful shutdown.
    pub fn initiate_graceful_shutdown(&mut self) -> Operations {
        let mut ops = Operations::none();
        match &self.state {
            State::Operating(t) if t.open_streams > 0 => {
                let t = *t;
                ops.notify = Some(ManagerEvent::Quiescing);
                let watermark = if self.role == Role::Server {
                    ops.goaway = Some(GoAway {
                        last_peer_stream_id: MAX_STREAM_ID,
                        enhance_your_calm: false,
                    });
                    ops.ping_after_goaway = true;
                    MAX_STREAM_ID
                } else {
                    ops.goaway = Some(GoAway {
                        last_peer_stream_id: t.last_peer_stream_id,
                        enhance_your_calm: false,
                    });
                    t.last_peer_stream_id
                };
                self.state = State::Quiescing(QuiescingState {
                    tracking: t,
                    initiated_by_us: true,
                    goaway_watermark: watermark,
                });
            }
            State::Operating(t) => {
                let t = *t;
                ops.goaway = Some(GoAway {
                    last_peer_stream_id: t.last_peer_stream_id,
                    enhance_your_calm: false,
                });
                ops.close_channel = true;
                self.state = State::Closing(ClosingState {
                    should_idle: false,
                    initiated_by_us: true,
                    tracking: t,
                });
            }
            State::WaitingToIdle(t) => {
                let t = *t;
                ops.idle_timer = Some(TimerOp::Cancel);
                ops.goaway = Some(GoAway {
                    last_peer_stream_id: t.last_peer_stream_id,
                    enhance_your_calm: false,
                });
                ops.close_channel = true;
                self.state = State::Closing(ClosingState {
                    should_idle: false,
                    initiated_by_us: true,
                    tracking: t,
                });
            }
            State::Quiescing(_) | State::Closing(_) | State::Closed => {}
        }
        ops
    }

    /// Tear the connection down immediately, abandoning open streams.
    ///
    /// Used for fatal conditions such as a keepalive timeout, and for the
    /// ping-strike defense (`enhance_your_calm`).
    pub fn shutdown_now(&mut self, enhance_your_calm: bool) -> Operations {
        let mut ops = Operations::none();

        let (tracking, cancel_idle) = match &self.state {
            State::Operating(t) => (*t, false),
            State::WaitingToIdle(t) => (*t, true),
            State::Quiescing(q) => (q.tracking, false),
            State::Closing(_) | State::Closed => return ops,
        };

        if cancel_idle {
            ops.idle_timer = Some(TimerOp::Cancel);
        }
        ops.goaway = Some(GoAway {
            last_peer_stream_id: tracking.last_peer_stream_id,
            enhance_your_calm,
        });
        ops.close_channel = true;
        self.state = State::Closing(ClosingState {
            should_idle: false,
            initiated_by_us: true,
            tracking,
        });
        ops
    }

    /// The transport reported the connection gone.
    pub fn channel_inactive(&mut self) -> Operations {
        let mut ops = Operations::none();

        let notify = match &self.state {
            State::Closing(c) if c.should_idle => Some(ManagerEvent::Idle),
            State::Closing(c) => Some(inactive_kind(&c.tracking, c.initiated_by_us)),
            State::Operating(t) | State::WaitingToIdle(t) => Some(inactive_kind(t, false)),
            State::Quiescing(q) => Some(inactive_kind(&q.tracking, q.initiated_by_us)),
            State::Closed => None,
        };

        ops.notify = notify;
        self.state = State::Closed;
        ops
    }
}

fn inactive_kind(tracking: &Tracking, initiated_by_us: bool) -> ManagerEvent {
    if tracking.seen_settings && tracking.open_streams == 0 && !initiated_by_us {
        ManagerEvent::Idle
    } else {
        ManagerEvent::Inactive
    }
}

impl std::fmt::Debug for IdleStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleStateMachine")
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}
