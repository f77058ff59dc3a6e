//! The client connection manager.
//!
//! A [`ConnectionManager`] owns one managed connection to a target: it
//! brings sockets up through an abstract [`Connector`](tower_service::Service),
//! watches the connection's lifecycle notifications
//! ([`ManagerEvent`](crate::transport::idle::ManagerEvent)), publishes
//! [`ConnectivityState`] through a watch channel, and schedules reconnects
//! with jittered exponential backoff.
//!
//! The manager runs as a single task; callers talk to it through the
//! cloneable [`ManagerHandle`]. No lock is held while subscriber callbacks
//! run: state observation is a `watch` subscription, the Rust shape of a
//! connectivity delegate.

mod backoff;

pub use backoff::{BackoffIterator, BackoffStep, ConnectionBackoff, Retries};

use std::{
    fmt,
    future::poll_fn,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use http::Uri;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tower_service::Service;
use tracing::{debug, trace};

use crate::transport::idle::ManagerEvent;

/// The externally visible state of a managed channel.
///
/// Transitions are monotone into [`Shutdown`](ConnectivityState::Shutdown):
/// a channel that shut down never leaves that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection and none wanted yet.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection has seen its first SETTINGS and can carry RPCs.
    Ready,
    /// The connection was lost; a reconnect is scheduled.
    TransientFailure,
    /// The channel is permanently done.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient-failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A live transport connection the manager can dispose of.
///
/// The manager never owns the connection's event loop; it only needs a way
/// to ask the transport to go away, both on user shutdown and when a
/// shutdown races a connect attempt that then resolves.
pub trait ConnectionHandle: Send + 'static {
    /// Signal the transport to close. Must be idempotent.
    fn close(&mut self);
}

enum Command {
    Connect,
    Shutdown,
    Connection(ManagerEvent),
}

/// Cloneable handle for talking to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectivityState>,
    shutdown_flag: Arc<AtomicBool>,
}

impl ManagerHandle {
    /// Ask the manager to bring a connection up.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Shut the channel down permanently.
    ///
    /// Safe to call at any time; a connect attempt already in flight is
    /// disposed of as soon as it resolves.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Forward a connection lifecycle notification produced by the idle
    /// state machine's [`Operations`](crate::transport::idle::Operations).
    pub fn connection_event(&self, event: ManagerEvent) {
        let _ = self.commands.send(Command::Connection(event));
    }

    /// The current connectivity state.
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Subscribe to connectivity transitions. The stream yields the current
    /// state immediately, then every change.
    pub fn subscribe(&self) -> WatchStream<ConnectivityState> {
        WatchStream::new(self.state.clone())
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Supervises one managed connection: connect, observe, back off, repeat.
pub struct ConnectionManager<C>
where
    C: Service<Uri>,
{
    connector: C,
    target: Uri,
    backoff: ConnectionBackoff,
    state_tx: watch::Sender<ConnectivityState>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown_flag: Arc<AtomicBool>,
    current: Option<C::Response>,
}

enum Supervised {
    BecameIdle,
    FailedBeforeReady,
    FailedAfterReady,
}

impl<C> ConnectionManager<C>
where
    C: Service<Uri>,
    C::Response: ConnectionHandle,
    C::Error: Into<crate::BoxError>,
{
    /// Create a manager for `target` and the handle to drive it with.
    ///
    /// Nothing happens until the returned future from
    /// [`run`](ConnectionManager::run) is polled and
    /// [`connect`](ManagerHandle::connect) is called.
    pub fn new(
        connector: C,
        target: Uri,
        backoff: ConnectionBackoff,
    ) -> (Self, ManagerHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Idle);
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let handle = ManagerHandle {
            commands: commands_tx,
            state: state_rx,
            shutdown_flag: shutdown_flag.clone(),
        };

        let manager = ConnectionManager {
            connector,
            target,
            backoff,
            state_tx,
            commands: commands_rx,
            shutdown_flag,
            current: None,
        };

        (manager, handle)
    }

    /// Drive the channel until it shuts down.
    pub async fn run(mut self) {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => {
                    self.enter_shutdown();
                    return;
                }
                Some(Command::Connect) => {
                    if self.drive_connection().await.is_err() {
                        return;
                    }
                }
                // A notification from a connection that is already gone.
                Some(Command::Connection(event)) => {
                    trace!(?event, "ignoring connection event while idle")
                }
            }
        }
    }

    /// Connect and supervise until the channel goes idle (`Ok`) or shuts
    /// down (`Err`).
    async fn drive_connection(&mut self) -> Result<(), ()> {
        let mut backoff = self.backoff.iter();

        loop {
            let Some(mut step) = backoff.next() else {
                debug!("connection retries exhausted; shutting the channel down");
                self.enter_shutdown();
                return Err(());
            };

            self.publish(ConnectivityState::Connecting);

            match self.attempt(step.connect_timeout).await {
                Ok(handle) => {
                    if self.shutdown_flag.load(Ordering::SeqCst) {
                        // The user shut the channel down while this connect
                        // was in flight: the fresh channel must not survive.
                        let mut handle = handle;
                        handle.close();
                        self.enter_shutdown();
                        return Err(());
                    }

                    self.current = Some(handle);
                    match self.supervise().await? {
                        Supervised::BecameIdle => {
                            self.publish(ConnectivityState::Idle);
                            return Ok(());
                        }
                        Supervised::FailedAfterReady => {
                            // The connection was good; retreat to a fresh
                            // backoff schedule, including the pending sleep.
                            backoff = self.backoff.iter();
                            if let Some(fresh) = backoff.next() {
                                step = fresh;
                            }
                        }
                        Supervised::FailedBeforeReady => {}
                    }
                }
                Err(err) => {
                    debug!("connection attempt failed: {err}");
                }
            }

            self.publish(ConnectivityState::TransientFailure);
            self.sleep_backoff(step.delay).await?;
        }
    }

    /// One connect attempt, bounded by the backoff step's timeout.
    async fn attempt(&mut self, connect_timeout: Duration) -> Result<C::Response, crate::BoxError> {
        poll_fn(|cx| self.connector.poll_ready(cx))
            .await
            .map_err(Into::into)?;

        let connecting = self.connector.call(self.target.clone());
        match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(crate::Status::deadline_exceeded("connection attempt timed out").into()),
        }
    }

    /// Watch a live connection's notifications until it goes away.
    async fn supervise(&mut self) -> Result<Supervised, ()> {
        let mut was_ready = false;
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => {
                    self.enter_shutdown();
                    return Err(());
                }
                Some(Command::Connect) => {
                    // Already connected.
                }
                Some(Command::Connection(event)) => match event {
                    ManagerEvent::Ready => {
                        was_ready = true;
                        self.publish(ConnectivityState::Ready);
                    }
                    ManagerEvent::Quiescing => {
                        trace!("connection is quiescing");
                    }
                    ManagerEvent::Idle => {
                        self.current = None;
                        return Ok(Supervised::BecameIdle);
                    }
                    ManagerEvent::Inactive => {
                        self.current = None;
                        return Ok(if was_ready {
                            Supervised::FailedAfterReady
                        } else {
                            Supervised::FailedBeforeReady
                        });
                    }
                },
            }
        }
    }

    /// Wait out a backoff delay, still responsive to shutdown and to an
    /// explicit connect request cutting the wait short.
    async fn sleep_backoff(&mut self, delay: Duration) -> Result<(), ()> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return Ok(()),
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        self.enter_shutdown();
                        return Err(());
                    }
                    Some(Command::Connect) => return Ok(()),
                    Some(Command::Connection(event)) => {
                        trace!(?event, "ignoring connection event during backoff")
                    }
                },
            }
        }
    }

    fn enter_shutdown(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.close();
        }
        self.publish(ConnectivityState::Shutdown);
    }

    /// Publish a state change. Once `Shutdown` is published nothing else
    /// ever is.
    fn publish(&self, state: ConnectivityState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == state {
                return false;
            }
            trace!(from = %current, to = %state, "connectivity changed");
            *current = state;
            true
        });
    }
}

impl<C> fmt::Debug for ConnectionManager<C>
where
    C: Service<Uri>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        future::Future,
        pin::Pin,
        sync::Mutex,
        task::{Context, Poll},
    };
    use tokio_stream::StreamExt;

    #[derive(Debug)]
    struct MockHandle {
        closed: Arc<AtomicBool>,
    }

    impl ConnectionHandle for MockHandle {
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    type ConnectResult = Result<MockHandle, crate::BoxError>;

    /// A connector that plays back scripted results.
    struct MockConnector {
        script: Arc<Mutex<VecDeque<ConnectResult>>>,
    }

    impl MockConnector {
        fn new(script: Vec<ConnectResult>) -> Self {
            MockConnector {
                script: Arc::new(Mutex::new(script.into_iter().collect())),
            }
        }
    }

    impl Service<Uri> for MockConnector {
        type Response = MockHandle;
        type Error = crate::BoxError;
        type Future = Pin<Box<dyn Future<Output = ConnectResult> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _target: Uri) -> Self::Future {
            let script = self.script.clone();
            Box::pin(async move {
                // Wait for a scripted result to appear; tests gate the
                // shutdown race by pushing one late.
                loop {
                    if let Some(result) = script.lock().unwrap().pop_front() {
                        return result;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        }
    }

    fn ok_handle() -> (ConnectResult, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Ok(MockHandle {
                closed: closed.clone(),
            }),
            closed,
        )
    }

    fn target() -> Uri {
        Uri::from_static("http://example.com:50051")
    }

    fn fast_backoff() -> ConnectionBackoff {
        ConnectionBackoff {
            initial_backoff: Duration::from_millis(10),
            maximum_backoff: Duration::from_millis(100),
            jitter: 0.0,
            ..ConnectionBackoff::default()
        }
    }

    async fn wait_for(handle: &ManagerHandle, wanted: ConnectivityState) {
        let mut states = handle.subscribe();
        while let Some(state) = states.next().await {
            if state == wanted {
                return;
            }
        }
        panic!("state stream ended before reaching {wanted}");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_ready() {
        let (result, _closed) = ok_handle();
        let (manager, handle) =
            ConnectionManager::new(MockConnector::new(vec![result]), target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        assert_eq!(handle.state(), ConnectivityState::Idle);
        handle.connect();
        wait_for(&handle, ConnectivityState::Connecting).await;

        // The connection reports its first SETTINGS.
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.shutdown();
        wait_for(&handle, ConnectivityState::Shutdown).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_backs_off_then_reconnects() {
        let (result, _closed) = ok_handle();
        let connector = MockConnector::new(vec![Err("boom".into()), result]);
        let (manager, handle) = ConnectionManager::new(connector, target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.connect();
        wait_for(&handle, ConnectivityState::TransientFailure).await;

        // The paused clock drives the backoff sleep into the second
        // attempt, which succeeds and becomes ready.
        wait_for(&handle, ConnectivityState::Connecting).await;
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_shut_the_channel_down() {
        let connector = MockConnector::new(vec![Err("a".into()), Err("b".into())]);
        let backoff = ConnectionBackoff {
            retries: Retries::Upto(2),
            ..fast_backoff()
        };
        let (manager, handle) = ConnectionManager::new(connector, target(), backoff);
        let task = tokio::spawn(manager.run());

        handle.connect();
        wait_for(&handle, ConnectivityState::Shutdown).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_connect_closes_the_late_channel() {
        // An empty script never resolves; use a gated one instead.
        let (result, closed) = ok_handle();
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let connector = MockConnector {
            script: script.clone(),
        };
        let (manager, handle) = ConnectionManager::new(connector, target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.connect();
        wait_for(&handle, ConnectivityState::Connecting).await;

        // Shutdown races the in-flight connect...
        handle.shutdown();
        // ...which then resolves successfully.
        script.lock().unwrap().push_back(result);

        wait_for(&handle, ConnectivityState::Shutdown).await;
        task.await.unwrap();
        assert!(closed.load(Ordering::SeqCst), "late channel must be closed");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_monotone() {
        let (manager, handle) =
            ConnectionManager::new(MockConnector::new(vec![]), target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.shutdown();
        wait_for(&handle, ConnectivityState::Shutdown).await;

        handle.connect();
        handle.connection_event(ManagerEvent::Ready);
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), ConnectivityState::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_parks_until_the_next_connect() {
        let (first, first_closed) = ok_handle();
        let (second, _second_closed) = ok_handle();
        let connector = MockConnector::new(vec![first, second]);
        let (manager, handle) = ConnectionManager::new(connector, target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.connect();
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        // The connection idles away gracefully.
        handle.connection_event(ManagerEvent::Idle);
        wait_for(&handle, ConnectivityState::Idle).await;
        assert!(!first_closed.load(Ordering::SeqCst));

        // A new connect brings up a fresh connection.
        handle.connect();
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_after_ready_reenters_transient_failure() {
        let (first, _c1) = ok_handle();
        let (second, _c2) = ok_handle();
        let connector = MockConnector::new(vec![first, second]);
        let (manager, handle) = ConnectionManager::new(connector, target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.connect();
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.connection_event(ManagerEvent::Inactive);
        wait_for(&handle, ConnectivityState::TransientFailure).await;

        wait_for(&handle, ConnectivityState::Connecting).await;
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_live_connection() {
        let (result, closed) = ok_handle();
        let (manager, handle) =
            ConnectionManager::new(MockConnector::new(vec![result]), target(), fast_backoff());
        let task = tokio::spawn(manager.run());

        handle.connect();
        handle.connection_event(ManagerEvent::Ready);
        wait_for(&handle, ConnectivityState::Ready).await;

        handle.shutdown();
        wait_for(&handle, ConnectivityState::Shutdown).await;
        task.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}
