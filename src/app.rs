//! Headless driver loop.
//!
//! [`App`] connects the session to a [`Viewer`]: lifecycle events and decoded messages
//! are applied in arrival order, commands produced by the viewer are sent back, and a
//! fixed-rate frame tick advances animations and hands the scene to a [`Renderer`].
//! Everything runs on one task, so scene mutation never races with rendering.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Notification, ViewerError, ViewerResult};
use crate::export::{self, SimulationResult};
use crate::protocol::{InboundMessage, OutboundCommand};
use crate::transport::{ConnectionState, LifecycleEvent, SessionHandle, Target};
use crate::viewer::{ViewMode, Viewer, ViewerEvent};

/// Receives the scene once per frame.
pub trait Renderer: Send {
    /// Draws the current state of the viewer.
    fn render(&mut self, viewer: &Viewer);
}

/// Renderer that logs scene statistics at `trace` level.
#[derive(Debug, Default)]
pub struct TracingRenderer {
    frames: u64,
}

impl TracingRenderer {
    /// Number of frames rendered.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Renderer for TracingRenderer {
    fn render(&mut self, viewer: &Viewer) {
        self.frames += 1;
        let scene = viewer.scene();
        trace!(
            frame = self.frames,
            view = %viewer.mode(),
            primitives = scene.primitives().len(),
            synapses = scene.synapse_count(),
            edges = scene.edges().len(),
            outline = scene.outline().visible,
            "Rendered frame"
        );
    }
}

/// What the driver does once the model is loaded.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Model or URL to load.
    pub target: Target,
    /// View to switch to once the dendrogram arrives.
    pub view: ViewMode,
    /// Start a simulation once the morphology arrives and stop after `sim_done`.
    pub run: bool,
    /// Segments to record.
    pub record: Vec<String>,
    /// Section to place the current clamp on.
    pub iclamp: Option<String>,
    /// Where to write the `sim_done` CSV; the recordings go to
    /// [`export::recordings_path`] of it.
    pub export: Option<PathBuf>,
    /// Interval of the render tick.
    pub frame_interval: Duration,
}

impl RunOptions {
    /// Options that only load `target` in the 3-D view.
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            view: ViewMode::Anatomical,
            run: false,
            record: Vec::new(),
            iclamp: None,
            export: None,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Outcome of [`App::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Voltage frames applied to the scene.
    pub frames_applied: usize,
    /// Final traces, if the run finished.
    pub result: Option<SimulationResult>,
    /// Path the result was written to.
    pub exported: Option<PathBuf>,
    /// Path the recorded sites were written to.
    pub recordings_exported: Option<PathBuf>,
    /// User-visible notifications in arrival order.
    pub notifications: Vec<Notification>,
    /// Session state when the loop ended, before the final disconnect.
    pub final_state: ConnectionState,
}

#[derive(Debug, Default)]
struct Progress {
    view_requested: bool,
    iclamp_sent: bool,
    run_started: bool,
}

/// Session-to-viewer driver.
pub struct App<R: Renderer> {
    viewer: Viewer,
    session: SessionHandle,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    events: broadcast::Receiver<LifecycleEvent>,
    renderer: R,
    options: RunOptions,
    progress: Progress,
    summary: RunSummary,
    started: Instant,
}

impl<R: Renderer> App<R> {
    /// Creates a driver; subscribes to lifecycle events immediately.
    pub fn new(
        viewer: Viewer,
        session: SessionHandle,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        renderer: R,
        options: RunOptions,
    ) -> Self {
        let events = session.subscribe();
        Self {
            viewer,
            session,
            inbound,
            events,
            renderer,
            options,
            progress: Progress::default(),
            summary: RunSummary::default(),
            started: Instant::now(),
        }
    }

    /// The viewer driven by this app.
    #[must_use]
    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    /// The renderer.
    #[must_use]
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Connects and drives the session until it ends, the run finishes or `shutdown`
    /// resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> ViewerResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        self.session.connect(self.options.target.clone())?;
        self.started = Instant::now();

        let mut frame = tokio::time::interval(self.options.frame_interval);
        frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            let done = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    true
                }
                event = self.events.recv() => match event {
                    Ok(event) => self.on_lifecycle(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Lifecycle events lagged");
                        false
                    }
                    Err(broadcast::error::RecvError::Closed) => true,
                },
                message = self.inbound.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => true,
                },
                _ = frame.tick() => {
                    self.on_frame();
                    false
                }
            };
            if done {
                break;
            }
        }

        self.summary.final_state = self.session.state();
        let mut state = self.session.state_watch();
        self.session.disconnect(false);
        if state
            .wait_for(|s| matches!(s, ConnectionState::Closed))
            .await
            .is_err()
        {
            debug!("Session task already stopped");
        }
        info!(
            frames = self.summary.frames_applied,
            state = self.summary.final_state.label(),
            "Viewer stopped"
        );
        Ok(std::mem::take(&mut self.summary))
    }

    fn now_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Connecting { attempt } => {
                info!(attempt, "Connecting to backend");
                false
            }
            LifecycleEvent::Open => {
                self.progress = Progress::default();
                let commands = self.viewer.on_session_open(&self.options.target);
                self.send_all(commands).await;
                false
            }
            LifecycleEvent::Closed => {
                warn!("Connection closed, waiting for reconnect");
                false
            }
            LifecycleEvent::Error(notification) => {
                error!(message = %notification.msg, "Session failed");
                self.summary.notifications.push(notification);
                true
            }
            LifecycleEvent::Disconnected(message) => {
                if !message.is_empty() {
                    warn!(message = %message, "Session disconnected");
                    self.summary.notifications.push(Notification::new(message));
                }
                true
            }
        }
    }

    async fn on_message(&mut self, message: InboundMessage) -> bool {
        let events = self.viewer.handle(message);
        let mut done = false;
        for event in events {
            done |= self.on_event(event).await;
        }
        done
    }

    async fn on_event(&mut self, event: ViewerEvent) -> bool {
        match event {
            ViewerEvent::MorphologyLoaded { .. } => {
                if let Some(iclamp) = self.options.iclamp.clone() {
                    if !self.progress.iclamp_sent {
                        self.progress.iclamp_sent = true;
                        if let Some(command) = self.viewer.place_iclamp(Some(&iclamp)) {
                            self.send(command).await;
                        }
                    }
                }
                if self.options.run && !self.progress.run_started {
                    self.progress.run_started = true;
                    if !self.options.record.is_empty() {
                        self.viewer.set_record_from(self.options.record.clone());
                    }
                    let command = self.viewer.start_simulation();
                    self.send(command).await;
                }
                false
            }
            ViewerEvent::DendrogramLoaded { .. } => {
                if self.options.view == ViewMode::Dendrogram && !self.progress.view_requested {
                    self.progress.view_requested =
                        self.viewer.switch_view(ViewMode::Dendrogram, self.now_ms());
                }
                false
            }
            ViewerEvent::VoltageFrame { .. } => {
                self.summary.frames_applied += 1;
                false
            }
            ViewerEvent::SimulationDone(result) => {
                if let Some(path) = self.options.export.clone() {
                    match result.save(&path) {
                        Ok(()) => self.summary.exported = Some(path.clone()),
                        Err(e) => self.export_failed(&path, &e),
                    }
                    let recordings = export::recordings_path(&path);
                    match export::save_recordings(self.viewer.overlay().recording(), &recordings) {
                        Ok(()) => self.summary.recordings_exported = Some(recordings),
                        Err(e) => self.export_failed(&recordings, &e),
                    }
                }
                self.summary.result = Some(result);
                self.options.run
            }
            ViewerEvent::Status(notification) => {
                self.summary.notifications.push(notification);
                false
            }
            ViewerEvent::Error(notification) => {
                self.summary.notifications.push(notification);
                true
            }
            ViewerEvent::SectionInfo(text) => {
                info!(info = %text, "Section info");
                false
            }
            other => {
                debug!(event = ?other, "Viewer event");
                false
            }
        }
    }

    fn export_failed(&mut self, path: &Path, e: &ViewerError) {
        error!(path = %path.display(), error = %e, "Export failed");
        self.summary.notifications.push(e.notification());
    }

    fn on_frame(&mut self) {
        let now = self.now_ms();
        for event in self.viewer.tick(now) {
            debug!(event = ?event, "Viewer event");
        }
        self.renderer.render(&self.viewer);
    }

    async fn send_all(&mut self, commands: Vec<OutboundCommand>) {
        for command in commands {
            self.send(command).await;
        }
    }

    async fn send(&mut self, command: OutboundCommand) {
        let tag = command.tag();
        if let Err(e) = self.session.send(command).await {
            warn!(cmd = tag, error = %e, "Command not sent");
            self.summary.notifications.push(e.notification());
        }
    }
}
