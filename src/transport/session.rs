//! Session task and handle.
//!
//! [`spawn`] starts one task that owns the socket and the [`ConnectionState`]. Everything
//! else talks to it through a cloneable [`SessionHandle`]:
//!
//! - `connect(target)` starts (or supersedes) a retry cycle
//! - `send(command)` waits for the socket to open, then transmits
//! - `disconnect(notify)` closes deliberately; later sends fail with `NotConnected`
//!
//! State is published on a `watch` channel, lifecycle events on a `broadcast` channel and
//! decoded inbound messages on an `mpsc` channel, in arrival order. An inbound `error`
//! message ends the session and is reported as a lifecycle event instead of being
//! forwarded.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::backoff::{Backoff, BackoffPolicy, RETRY_EXHAUSTED_MESSAGE};
use super::socket::{Connector, Socket};
use super::state::{ConnectionState, LifecycleEvent, Target};
use crate::error::{Notification, ViewerError, ViewerResult};
use crate::protocol::{self, InboundMessage, OutboundCommand};

/// Message shown after a deliberate disconnect.
pub const DISCONNECT_MESSAGE: &str = "Disconnected. Please reload the page to reconnect.";

const EVENT_CAPACITY: usize = 256;

/// Configuration of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// WebSocket endpoint.
    pub endpoint: Url,
    /// Retry pacing.
    pub policy: BackoffPolicy,
    /// Close the session after this long without traffic.
    pub idle_timeout: Duration,
}

impl SessionOptions {
    /// Options with the default retry policy and a five minute idle timeout.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            policy: BackoffPolicy::default(),
            idle_timeout: Duration::from_millis(300_000),
        }
    }
}

type Ack = oneshot::Sender<ViewerResult<()>>;
type PendingOpen = Pin<Box<dyn Future<Output = ViewerResult<Box<dyn Socket>>> + Send>>;

enum Command {
    Connect(Target),
    Send(OutboundCommand, Ack),
    Disconnect { notify: bool },
}

/// Cloneable handle to the session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect(target) => write!(f, "Connect({target})"),
            Command::Send(command, _) => write!(f, "Send({})", command.tag()),
            Command::Disconnect { notify } => write!(f, "Disconnect {{ notify: {notify} }}"),
        }
    }
}

impl SessionHandle {
    /// Connects to a target, superseding any attempt in progress.
    ///
    /// Connecting again to the target of an open session is a no-op.
    pub fn connect(&self, target: Target) -> ViewerResult<()> {
        self.commands
            .send(Command::Connect(target))
            .map_err(|_| ViewerError::NotConnected)
    }

    /// Sends a command once the socket is open.
    ///
    /// Fails immediately with [`ViewerError::NotConnected`] after a deliberate disconnect,
    /// and with the terminal error once the session has failed for good.
    pub async fn send(&self, command: OutboundCommand) -> ViewerResult<()> {
        if matches!(*self.state.borrow(), ConnectionState::Closed) {
            return Err(ViewerError::NotConnected);
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Send(command, ack))
            .map_err(|_| ViewerError::NotConnected)?;
        done.await.map_err(|_| ViewerError::NotConnected)?
    }

    /// Closes the session deliberately. With `notify` the user is told to reload.
    pub fn disconnect(&self, notify: bool) {
        if self.commands.send(Command::Disconnect { notify }).is_err() {
            debug!("Session task already stopped");
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribes to lifecycle events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}

/// Spawns a session task with an entropy-seeded jitter source.
pub fn spawn<C: Connector>(
    connector: C,
    options: SessionOptions,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<InboundMessage>,
    JoinHandle<()>,
) {
    spawn_with_rng(connector, options, StdRng::from_entropy())
}

/// Spawns a session task drawing jitter from `rng`.
pub fn spawn_with_rng<C: Connector>(
    connector: C,
    options: SessionOptions,
    rng: StdRng,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<InboundMessage>,
    JoinHandle<()>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let task = SessionTask {
        connector: Arc::new(connector),
        options,
        rng,
        commands: command_rx,
        state: state_tx,
        events: event_tx.clone(),
        inbound: inbound_tx,
        target: None,
        backoff: None,
        retry_at: None,
        pending: None,
        socket: None,
        queue: VecDeque::new(),
        idle_deadline: None,
        disconnected: false,
        failure: None,
    };
    let join = tokio::spawn(task.run());

    let handle = SessionHandle {
        commands: command_tx,
        state: state_rx,
        events: event_tx,
    };
    (handle, inbound_rx, join)
}

/// Why the session ended for good.
enum Failure {
    Rejected(Notification),
    Exhausted,
}

impl Failure {
    fn error(&self) -> ViewerError {
        match self {
            Failure::Rejected(notification) => {
                ViewerError::BackendRejected(notification.msg.clone())
            }
            Failure::Exhausted => {
                ViewerError::TransientNetworkFailure(RETRY_EXHAUSTED_MESSAGE.to_string())
            }
        }
    }

    fn notification(&self) -> Notification {
        match self {
            Failure::Rejected(notification) => notification.clone(),
            Failure::Exhausted => Notification::new(RETRY_EXHAUSTED_MESSAGE),
        }
    }
}

struct SessionTask {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    rng: StdRng,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    target: Option<Target>,
    backoff: Option<Backoff>,
    retry_at: Option<Instant>,
    pending: Option<PendingOpen>,
    socket: Option<Box<dyn Socket>>,
    queue: VecDeque<(OutboundCommand, Ack)>,
    idle_deadline: Option<Instant>,
    disconnected: bool,
    failure: Option<Failure>,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                () = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
                opened = poll_open(&mut self.pending) => {
                    self.pending = None;
                    self.on_open_result(opened).await;
                }
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                () = sleep_until(self.idle_deadline) => {
                    warn!(
                        idle_ms = self.options.idle_timeout.as_millis() as u64,
                        "No traffic within the idle timeout, disconnecting"
                    );
                    self.disconnect(true).await;
                }
            }
        }
        self.close_socket().await;
        debug!("Session task stopped");
    }

    async fn on_command(&mut self, command: Command) {
        trace!(?command, "Session command");
        match command {
            Command::Connect(target) => self.connect(target).await,
            Command::Send(command, ack) => self.send(command, ack).await,
            Command::Disconnect { notify } => self.disconnect(notify).await,
        }
    }

    async fn connect(&mut self, target: Target) {
        if self.socket.is_some() && self.target.as_ref() == Some(&target) {
            debug!(%target, "Already connected to target");
            return;
        }

        info!(%target, endpoint = %self.options.endpoint, "Connecting session");
        self.reset_connection().await;
        self.target = Some(target);
        self.disconnected = false;
        self.failure = None;
        self.backoff = Some(Backoff::new(self.options.policy, &mut self.rng));
        self.schedule_attempt().await;
    }

    async fn send(&mut self, command: OutboundCommand, ack: Ack) {
        if self.disconnected {
            let _ = ack.send(Err(ViewerError::NotConnected));
            return;
        }
        if let Some(failure) = &self.failure {
            let _ = ack.send(Err(failure.error()));
            return;
        }
        if self.socket.is_some() {
            let result = self.transmit(&command).await;
            let _ = ack.send(result);
        } else {
            debug!(cmd = command.tag(), "Queueing command until the socket opens");
            self.queue.push_back((command, ack));
        }
    }

    async fn disconnect(&mut self, notify: bool) {
        self.disconnected = true;
        self.target = None;
        self.reset_connection().await;
        self.set_state(ConnectionState::Closed);
        self.fail_queue(|| ViewerError::NotConnected);

        let message = if notify {
            DISCONNECT_MESSAGE.to_string()
        } else {
            String::new()
        };
        info!(notify, "Session disconnected");
        self.publish(LifecycleEvent::Disconnected(message));
    }

    /// Schedules the next attempt of the current cycle, or fails once the cap is reached.
    async fn schedule_attempt(&mut self) {
        let Some(backoff) = self.backoff.as_mut() else {
            return;
        };
        match backoff.next_attempt() {
            Some((attempt, delay)) => {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling connection attempt"
                );
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Connecting { attempt });
                self.publish(LifecycleEvent::Connecting { attempt });
            }
            None => {
                warn!(
                    max_attempts = self.options.policy.max_attempts,
                    "Max connection attempts reached"
                );
                self.fail(Failure::Exhausted).await;
            }
        }
    }

    fn start_attempt(&mut self) {
        let connector = Arc::clone(&self.connector);
        let endpoint = self.options.endpoint.clone();
        self.pending = Some(Box::pin(async move { connector.open(&endpoint).await }));
    }

    async fn on_open_result(&mut self, result: ViewerResult<Box<dyn Socket>>) {
        match result {
            Ok(socket) => {
                info!(endpoint = %self.options.endpoint, "Session open");
                self.socket = Some(socket);
                self.backoff = None;
                self.set_state(ConnectionState::Open);
                self.publish(LifecycleEvent::Open);
                self.touch();
                self.flush_queue().await;
            }
            Err(e) => {
                let attempt = self.backoff.as_ref().map_or(0, Backoff::attempt);
                warn!(attempt, error = %e, "Connection attempt failed");
                self.schedule_attempt().await;
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<ViewerResult<String>>) {
        match frame {
            Some(Ok(text)) => {
                self.touch();
                self.dispatch(&text).await;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Socket error");
                self.on_socket_closed().await;
            }
            None => self.on_socket_closed().await,
        }
    }

    async fn dispatch(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(InboundMessage::Error(message)) => {
                let notification = message.into_notification();
                error!(error = %notification, "Backend rejected the session");
                self.fail(Failure::Rejected(notification)).await;
            }
            Ok(message) => {
                trace!(cmd = message.tag(), "Received message");
                if self.inbound.send(message).is_err() {
                    debug!("Inbound receiver dropped, discarding message");
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed message"),
        }
    }

    async fn on_socket_closed(&mut self) {
        self.socket = None;
        self.idle_deadline = None;
        info!("Socket closed");
        self.publish(LifecycleEvent::Closed);

        if self.disconnected || self.failure.is_some() || self.target.is_none() {
            return;
        }
        self.backoff = Some(Backoff::new(self.options.policy, &mut self.rng));
        self.schedule_attempt().await;
    }

    async fn fail(&mut self, failure: Failure) {
        self.reset_connection().await;
        let notification = failure.notification();
        self.set_state(ConnectionState::FatallyErrored {
            message: notification.msg.clone(),
        });
        self.fail_queue(|| failure.error());
        self.failure = Some(failure);
        self.publish(LifecycleEvent::Error(notification));
    }

    async fn transmit(&mut self, command: &OutboundCommand) -> ViewerResult<()> {
        let text = protocol::encode(command)?;
        let socket = self.socket.as_mut().ok_or(ViewerError::NotConnected)?;
        socket.send_text(text).await?;
        self.touch();
        trace!(cmd = command.tag(), "Sent command");
        Ok(())
    }

    async fn flush_queue(&mut self) {
        while let Some((command, ack)) = self.queue.pop_front() {
            let result = self.transmit(&command).await;
            let _ = ack.send(result);
        }
    }

    fn fail_queue(&mut self, error: impl Fn() -> ViewerError) {
        for (command, ack) in self.queue.drain(..) {
            debug!(cmd = command.tag(), "Dropping queued command");
            let _ = ack.send(Err(error()));
        }
    }

    /// Drops the socket, the pending attempt and any scheduled retry.
    async fn reset_connection(&mut self) {
        self.close_socket().await;
        self.pending = None;
        self.retry_at = None;
        self.backoff = None;
        self.idle_deadline = None;
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close().await {
                debug!(error = %e, "Error while closing socket");
            }
        }
    }

    fn touch(&mut self) {
        if self.socket.is_some() {
            self.idle_deadline = Some(Instant::now() + self.options.idle_timeout);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_open(pending: &mut Option<PendingOpen>) -> ViewerResult<Box<dyn Socket>> {
    match pending {
        Some(open) => open.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<Box<dyn Socket>>) -> Option<ViewerResult<String>> {
    match socket {
        Some(socket) => socket.next_text().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn options() -> SessionOptions {
        SessionOptions::new(Url::parse("ws://backend.test/ws").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_send_flushes_on_open() {
        let connector = MemoryConnector::new();
        connector.refuse("not yet");
        let mut peer = connector.accept();
        let (handle, _inbound, _task) =
            spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(3));

        handle.connect(Target::Model("model-42".into())).unwrap();
        handle.send(OutboundCommand::GetUiData).await.unwrap();

        assert_eq!(peer.recv().await.unwrap().unwrap(), OutboundCommand::GetUiData);
        assert_eq!(connector.attempts(), 2);
        assert!(handle.state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_peer_close() {
        let connector = MemoryConnector::new();
        let mut first = connector.accept();
        let mut second = connector.accept();
        let (handle, _inbound, _task) =
            spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(5));
        let mut events = handle.subscribe();

        handle.connect(Target::Model("model-42".into())).unwrap();
        handle.send(OutboundCommand::GetUiData).await.unwrap();
        assert!(first.recv().await.is_some());

        first.close();
        let mut saw_closed = false;
        while let Ok(event) = events.recv().await {
            match event {
                LifecycleEvent::Closed => saw_closed = true,
                LifecycleEvent::Open if saw_closed => break,
                _ => {}
            }
        }
        handle.send(OutboundCommand::StopSimulation).await.unwrap();
        assert_eq!(
            second.recv().await.unwrap().unwrap(),
            OutboundCommand::StopSimulation
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_same_target_while_open_is_noop() {
        let connector = MemoryConnector::new();
        let _peer = connector.accept();
        let (handle, _inbound, _task) =
            spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(9));
        let mut state = handle.state_watch();

        handle.connect(Target::Model("model-42".into())).unwrap();
        state.wait_for(ConnectionState::is_open).await.unwrap();

        handle.connect(Target::Model("model-42".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(handle.state().is_open());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_dropped() {
        let connector = MemoryConnector::new();
        let peer = connector.accept();
        let (handle, mut inbound, _task) =
            spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(11));

        handle.connect(Target::Model("model-42".into())).unwrap();
        handle.state_watch().wait_for(ConnectionState::is_open).await.unwrap();

        assert!(peer.send_text(r#"{"cmd":"teleport","data":1}"#));
        assert!(peer.send_text("not json"));
        assert!(peer.send_text(r#"{"cmd":"status","data":"ready"}"#));

        let message = inbound.recv().await.unwrap();
        assert_eq!(message.tag(), "status");
        assert!(handle.state().is_open());
    }
}
