//! Viewer state and inbound message dispatch.
//!
//! [`Viewer`] owns everything the render loop mutates: the morphology, the scene, the
//! voltage overlay, the camera and the running view transition. Inbound messages are
//! applied synchronously and in arrival order through [`Viewer::handle`], which reports
//! what changed as [`ViewerEvent`]s. User actions that need the backend return the
//! [`OutboundCommand`] to send; the viewer never talks to the session itself.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use glam::{Vec2, Vec3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::camera::{Camera, CameraSettings};
use crate::error::Notification;
use crate::export::{self, SimulationResult};
use crate::layout::{self, DendrogramLayout, LayoutOptions, Pose};
use crate::morphology::{parse_segment_name, segment_name, MorphologyModel};
use crate::overlay::VoltageOverlay;
use crate::params::SimulationParams;
use crate::protocol::{InboundMessage, OutboundCommand};
use crate::scene::Scene;
use crate::transport::Target;
use crate::tween::{
    GroupId, Tween, TweenAttribute, TweenScheduler, TweenTarget, TweenUpdate, TweenValue,
};

/// Default viewport size until the first resize.
const DEFAULT_VIEWPORT: (f32, f32) = (1280.0, 720.0);

/// Which layout the scene shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewMode {
    /// Segments at their measured 3-D pose, perspective camera.
    #[default]
    Anatomical,
    /// Flat tree of upright segments, orthographic camera.
    Dendrogram,
}

impl ViewMode {
    /// Short label used on the command line and in logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ViewMode::Anatomical => "3d",
            ViewMode::Dendrogram => "dendrogram",
        }
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "3d" | "anatomical" => Ok(ViewMode::Anatomical),
            "dendrogram" | "2d" => Ok(ViewMode::Dendrogram),
            other => Err(format!("Unknown view '{other}'. Must be one of: 3d, dendrogram")),
        }
    }
}

/// Something the viewer changed in response to a message or a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// A new morphology generation was loaded and the scene rebuilt.
    MorphologyLoaded {
        generation: u64,
        sections: usize,
        primitives: usize,
    },
    /// The section browser tree arrived.
    TopologyLoaded { roots: usize },
    /// The dendrogram tree arrived.
    DendrogramLoaded { root: String },
    /// Synapse cones were replaced.
    SynapsesAttached { count: usize },
    /// The current clamp moved.
    IclampMoved(Option<String>),
    /// Model description, passed through.
    ModelInfo(Value),
    /// Non-fatal backend status.
    Status(Notification),
    /// Fatal backend error.
    Error(Notification),
    /// Model-provided parameter values were applied.
    InitParamsApplied,
    /// A voltage frame recolored the scene.
    VoltageFrame { time: f64 },
    /// The run finished with final traces.
    SimulationDone(SimulationResult),
    /// Section description arrived.
    SectionInfo(String),
    /// The user clicked a segment.
    SegmentSelected { section: String, index: usize },
    /// A view transition finished.
    ViewChanged(ViewMode),
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    group: GroupId,
    to: ViewMode,
}

/// Render-side state of one viewer.
#[derive(Debug)]
pub struct Viewer {
    model: MorphologyModel,
    scene: Scene,
    overlay: VoltageOverlay,
    params: SimulationParams,
    camera: Camera,
    camera_settings: CameraSettings,
    tweens: TweenScheduler,
    tween_duration_ms: f64,
    layout_options: LayoutOptions,
    layout: Option<DendrogramLayout>,
    mode: ViewMode,
    transition: Option<Transition>,
    hovered: Option<usize>,
    target: Option<Target>,
    iclamp: Option<String>,
    result: Option<SimulationResult>,
    section_info: Option<String>,
    rng: StdRng,
}

impl Viewer {
    /// Creates a viewer with entropy-seeded synapse placement.
    #[must_use]
    pub fn new(camera_settings: CameraSettings, tween_duration_ms: f64) -> Self {
        Self::with_rng(camera_settings, tween_duration_ms, StdRng::from_entropy())
    }

    /// Creates a viewer with a caller-provided random source.
    #[must_use]
    pub fn with_rng(camera_settings: CameraSettings, tween_duration_ms: f64, rng: StdRng) -> Self {
        let (width, height) = DEFAULT_VIEWPORT;
        Self {
            model: MorphologyModel::new(),
            scene: Scene::new(),
            overlay: VoltageOverlay::new(),
            params: SimulationParams::default(),
            camera: Camera::perspective(camera_settings, width, height),
            camera_settings,
            tweens: TweenScheduler::new(),
            tween_duration_ms,
            layout_options: LayoutOptions::default(),
            layout: None,
            mode: ViewMode::Anatomical,
            transition: None,
            hovered: None,
            target: None,
            iclamp: None,
            result: None,
            section_info: None,
            rng,
        }
    }

    /// Overrides the dendrogram layout options.
    pub fn set_layout_options(&mut self, options: LayoutOptions) {
        self.layout_options = options;
    }

    /// Current morphology.
    #[must_use]
    pub fn model(&self) -> &MorphologyModel {
        &self.model
    }

    /// Renderable scene.
    #[must_use]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Voltage overlay and recording buffer.
    #[must_use]
    pub fn overlay(&self) -> &VoltageOverlay {
        &self.overlay
    }

    /// Active camera.
    #[must_use]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Parameters sent with the next `start_simulation`.
    #[must_use]
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Mutable access to the simulation parameters.
    pub fn params_mut(&mut self) -> &mut SimulationParams {
        &mut self.params
    }

    /// Current view; during a transition this is still the view being left.
    #[must_use]
    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Returns `true` while a view transition is animating.
    #[must_use]
    pub fn is_transitioning(&self) -> bool {
        self.transition.is_some()
    }

    /// Last computed dendrogram layout.
    #[must_use]
    pub fn layout(&self) -> Option<&DendrogramLayout> {
        self.layout.as_ref()
    }

    /// Index of the hovered primitive.
    #[must_use]
    pub fn hovered(&self) -> Option<usize> {
        self.hovered
    }

    /// Section holding the current clamp.
    #[must_use]
    pub fn iclamp(&self) -> Option<&str> {
        self.iclamp.as_deref()
    }

    /// Final traces of the last run.
    #[must_use]
    pub fn simulation_result(&self) -> Option<&SimulationResult> {
        self.result.as_ref()
    }

    /// Last section description.
    #[must_use]
    pub fn section_info(&self) -> Option<&str> {
        self.section_info.as_deref()
    }

    /// Resets the scene for a freshly opened session and returns the bootstrap commands.
    pub fn on_session_open(&mut self, target: &Target) -> Vec<OutboundCommand> {
        self.tweens.cancel_all();
        self.transition = None;
        self.overlay.stop_run(&mut self.scene);
        self.scene.clear();
        self.layout = None;
        self.hovered = None;
        self.enter_mode(ViewMode::Anatomical);
        self.target = Some(target.clone());
        info!(target = %target, "Session open, requesting model");
        vec![target.load_command(), OutboundCommand::GetUiData]
    }

    /// Applies one inbound message.
    pub fn handle(&mut self, message: InboundMessage) -> Vec<ViewerEvent> {
        let tag = message.tag();
        match message {
            InboundMessage::Morphology(payload) => match self.model.load(&payload) {
                Ok(generation) => {
                    self.tweens.cancel_all();
                    self.transition = None;
                    self.overlay.stop_run(&mut self.scene);
                    self.scene.rebuild(&self.model);
                    self.layout = None;
                    self.hovered = None;
                    self.enter_mode(ViewMode::Anatomical);
                    vec![ViewerEvent::MorphologyLoaded {
                        generation,
                        sections: self.model.sections().len(),
                        primitives: self.scene.primitives().len(),
                    }]
                }
                Err(e) => {
                    warn!(cmd = tag, error = %e, "Dropping malformed message");
                    Vec::new()
                }
            },
            InboundMessage::Topology(roots) => {
                let count = roots.len();
                self.model.load_topology(roots);
                vec![ViewerEvent::TopologyLoaded { roots: count }]
            }
            InboundMessage::Dendrogram(root) => {
                let name = root.name.clone();
                self.model.load_dendrogram(root);
                self.layout = None;
                vec![ViewerEvent::DendrogramLoaded { root: name }]
            }
            InboundMessage::Synapses(payload) => {
                let count = self.scene.attach_synapses(&payload, &mut self.rng);
                if self.mode == ViewMode::Dendrogram {
                    self.snap_synapses_to_dendrogram();
                }
                vec![ViewerEvent::SynapsesAttached { count }]
            }
            InboundMessage::Iclamp(section) => {
                debug!(section = ?section, "Current clamp moved");
                self.iclamp = section.clone();
                vec![ViewerEvent::IclampMoved(section)]
            }
            InboundMessage::Model(model) => vec![ViewerEvent::ModelInfo(model)],
            InboundMessage::Error(text) => {
                let notification = text.into_notification();
                warn!(message = %notification.msg, "Backend error");
                vec![ViewerEvent::Error(notification)]
            }
            InboundMessage::Status(text) => {
                let notification = text.into_notification();
                info!(message = %notification.msg, "Backend status");
                vec![ViewerEvent::Status(notification)]
            }
            InboundMessage::SimDone(payload) => match SimulationResult::try_from(payload) {
                Ok(result) => {
                    self.overlay.stop_run(&mut self.scene);
                    info!(rows = result.rows.len(), "Simulation finished");
                    self.result = Some(result.clone());
                    vec![ViewerEvent::SimulationDone(result)]
                }
                Err(e) => {
                    warn!(cmd = tag, error = %e, "Dropping malformed message");
                    Vec::new()
                }
            },
            InboundMessage::SimVoltage(frame) => {
                match self.overlay.apply_frame(&frame, &self.model, &mut self.scene) {
                    Ok(()) => vec![ViewerEvent::VoltageFrame { time: frame[0] }],
                    Err(e) => {
                        warn!(cmd = tag, error = %e, "Dropping voltage frame");
                        Vec::new()
                    }
                }
            }
            InboundMessage::SecInfo(info) => {
                let text = info.text().to_string();
                self.section_info = Some(text.clone());
                vec![ViewerEvent::SectionInfo(text)]
            }
            InboundMessage::InitParams(init) => {
                if self.params.apply_init_params(&init) {
                    info!("Applied model parameters");
                    vec![ViewerEvent::InitParamsApplied]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Starts an animated transition to `mode`.
    ///
    /// Returns `false` if the scene already shows `mode`, a transition is running, or the
    /// dendrogram tree has not arrived yet.
    pub fn switch_view(&mut self, mode: ViewMode, now_ms: f64) -> bool {
        if self.transition.is_some() || mode == self.mode {
            return false;
        }

        let targets = match mode {
            ViewMode::Dendrogram => {
                let Some(root) = self.model.dendrogram() else {
                    warn!("No dendrogram received, staying in 3-D view");
                    return false;
                };
                let layout = layout::compute_dendrogram(root, &self.layout_options);
                let targets = self.dendrogram_targets(&layout);
                self.layout = Some(layout);
                targets
            }
            ViewMode::Anatomical => {
                self.scene.set_edges(Vec::new());
                self.anatomical_targets()
            }
        };

        let group = self.tweens.begin_group();
        let duration_ms = self.tween_duration_ms;
        let mut add = |target: TweenTarget,
                       attribute: TweenAttribute,
                       from: TweenValue,
                       to: TweenValue| {
            self.tweens.add(Tween {
                group,
                target,
                attribute,
                from,
                to,
                start_ms: now_ms,
                duration_ms,
            });
        };

        for (index, (segment, synapses)) in targets.into_iter().enumerate() {
            let Some(primitive) = self.scene.primitives().get(index) else {
                continue;
            };
            if let Some(to) = segment {
                add_pose_tweens(&mut add, TweenTarget::Segment(index), &primitive.pose, &to);
            }
            for (synapse, to) in synapses.into_iter().enumerate() {
                if let Some(from) = primitive.synapses.get(synapse) {
                    add_pose_tweens(
                        &mut add,
                        TweenTarget::Synapse {
                            segment: index,
                            synapse,
                        },
                        &from.pose,
                        &to,
                    );
                }
            }
        }

        let camera = &self.camera;
        add(
            TweenTarget::Camera,
            TweenAttribute::Position,
            TweenValue::Vector(camera.position),
            TweenValue::Vector(Camera::home_position(&self.camera_settings)),
        );
        add(
            TweenTarget::Camera,
            TweenAttribute::LookAt,
            TweenValue::Vector(camera.controls.target),
            TweenValue::Vector(Vec3::ZERO),
        );
        add(
            TweenTarget::Camera,
            TweenAttribute::Up,
            TweenValue::Vector(camera.up),
            TweenValue::Vector(Vec3::Y),
        );
        add(
            TweenTarget::Camera,
            TweenAttribute::Zoom,
            TweenValue::Scalar(camera.zoom),
            TweenValue::Scalar(1.0),
        );

        self.camera.controls.enabled = false;
        self.scene.hide_outline();
        self.hovered = None;
        self.transition = Some(Transition { group, to: mode });
        debug!(to = %mode, tweens = self.tweens.len(), "View transition started");
        true
    }

    /// Advances running animations to `now_ms`.
    pub fn tick(&mut self, now_ms: f64) -> Vec<ViewerEvent> {
        let result = self.tweens.tick(now_ms);
        for update in &result.updates {
            self.apply_update(update);
        }

        let mut events = Vec::new();
        if let Some(transition) = self.transition {
            if result.completed.contains(&transition.group)
                || !self.tweens.is_group_active(transition.group)
            {
                self.transition = None;
                self.enter_mode(transition.to);
                if transition.to == ViewMode::Dendrogram {
                    if let Some(layout) = &self.layout {
                        self.scene.set_edges(layout.edges.clone());
                    }
                }
                info!(view = %transition.to, "View transition finished");
                events.push(ViewerEvent::ViewChanged(transition.to));
            }
        }
        events
    }

    /// Resolves the pointer position (normalized device coordinates) to a segment.
    ///
    /// The nearest hit is outlined and its name returned; no hit hides the outline.
    pub fn pointer_move(&mut self, ndc: Vec2) -> Option<String> {
        if self.transition.is_some() {
            return None;
        }
        let ray = self.camera.ray_from_ndc(ndc);
        match self.scene.pick(&ray) {
            Some(hit) => {
                self.outline(hit.primitive);
                self.scene
                    .primitives()
                    .get(hit.primitive)
                    .map(|p| p.name.clone())
            }
            None => {
                self.clear_hover();
                None
            }
        }
    }

    /// Outlines a segment given by name (`dend[3]_2`) or a bare section name (its first
    /// segment). Unknown names hide the outline.
    pub fn hover_segment(&mut self, name: &str) -> bool {
        let index = parse_segment_name(name)
            .and_then(|(section, segment)| {
                self.scene
                    .primitive_index(&segment_name(section, segment))
            })
            .or_else(|| self.scene.primitive_index(&segment_name(name, 0)));
        match index {
            Some(index) => {
                self.outline(index);
                true
            }
            None => {
                debug!(name, "Nothing to outline");
                self.clear_hover();
                false
            }
        }
    }

    /// Outlines the first segment of a section.
    pub fn hover_section(&mut self, section: &str) -> bool {
        self.hover_segment(&segment_name(section, 0))
    }

    /// Hides the outline.
    pub fn clear_hover(&mut self) {
        self.hovered = None;
        self.scene.hide_outline();
    }

    /// Selects the hovered segment.
    ///
    /// Returns the selection event and the `get_sec_info` request for its section.
    pub fn click(&mut self) -> Option<(ViewerEvent, OutboundCommand)> {
        let primitive = self.scene.primitives().get(self.hovered?)?;
        let section = primitive.section.clone();
        let index = primitive.segment;
        debug!(section = %section, index, "Segment selected");
        Some((
            ViewerEvent::SegmentSelected {
                section: section.clone(),
                index,
            },
            OutboundCommand::GetSecInfo(section),
        ))
    }

    /// Moves the current clamp to `section`; no selection means no command.
    pub fn place_iclamp(&mut self, section: Option<&str>) -> Option<OutboundCommand> {
        let section = section.map(str::trim).filter(|s| !s.is_empty())?;
        if self.model.section(section).is_none() {
            debug!(section, "Placing clamp on a section unknown to the current morphology");
        }
        Some(OutboundCommand::SetIclamp(section.to_string()))
    }

    /// Replaces the recording sites; returns how many were dropped over the limit.
    pub fn set_record_from<I, S>(&mut self, sites: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.set_record_from(sites)
    }

    /// Starts a run and returns the `start_simulation` command.
    pub fn start_simulation(&mut self) -> OutboundCommand {
        self.overlay.set_record_from(&self.params.record_from);
        self.overlay.start_run();
        self.scene.reset_colors();
        self.result = None;
        OutboundCommand::StartSimulation(self.params.clone())
    }

    /// Stops the run and returns the `stop_simulation` command.
    pub fn stop_simulation(&mut self) -> OutboundCommand {
        self.overlay.stop_run(&mut self.scene);
        OutboundCommand::StopSimulation
    }

    /// Recolors the scene from the stored frame at or after `time`.
    pub fn show_gradient_at(&mut self, time: f64) -> bool {
        self.overlay.show_gradient_at(time, &mut self.scene)
    }

    /// Adapts the camera to a new viewport size.
    pub fn resize(&mut self, width: f32, height: f32) {
        self.camera.resize(width, height);
    }

    /// Download name for the last result.
    #[must_use]
    pub fn export_file_name<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> String
    where
        Tz::Offset: fmt::Display,
    {
        let model = match &self.target {
            Some(Target::Model(name)) => Some(name.as_str()),
            _ => None,
        };
        export::suggested_file_name(model, self.iclamp.as_deref(), self.params.amp, at)
    }

    fn enter_mode(&mut self, mode: ViewMode) {
        let (width, height) = self.camera.size();
        self.camera = match mode {
            ViewMode::Anatomical => Camera::perspective(self.camera_settings, width, height),
            ViewMode::Dendrogram => Camera::orthographic(self.camera_settings, width, height),
        };
        if mode == ViewMode::Anatomical {
            self.scene.set_edges(Vec::new());
        }
        self.mode = mode;
    }

    fn outline(&mut self, index: usize) {
        self.hovered = Some(index);
        self.scene
            .show_outline(index, self.mode == ViewMode::Dendrogram);
    }

    /// Target poses for the dendrogram, per primitive: segment pose and synapse poses.
    fn dendrogram_targets(&mut self, layout: &DendrogramLayout) -> Vec<PoseTargets> {
        let rng = &mut self.rng;
        self.scene
            .primitives()
            .iter()
            .map(|primitive| {
                let segment = layout
                    .section(&primitive.section)
                    .and_then(|s| s.segments.get(primitive.segment))
                    .map(layout::dendrogram_pose);
                let synapses = primitive
                    .synapses
                    .iter()
                    .map(|_| {
                        layout::dendrogram_synapse_pose(rng, primitive.radius * 2.0, primitive.length)
                    })
                    .collect();
                (segment, synapses)
            })
            .collect()
    }

    fn anatomical_targets(&mut self) -> Vec<PoseTargets> {
        let rng = &mut self.rng;
        let model = &self.model;
        self.scene
            .primitives()
            .iter()
            .map(|primitive| {
                let segment = model
                    .find_segment(&primitive.section, primitive.segment)
                    .and_then(|(_, segment)| segment.geometry)
                    .map(|geometry| layout::anatomical_pose(&geometry));
                let synapses = primitive
                    .synapses
                    .iter()
                    .map(|synapse| {
                        layout::anatomical_synapse_pose(
                            rng,
                            primitive.radius * 2.0,
                            primitive.length,
                            synapse.height,
                        )
                    })
                    .collect();
                (segment, synapses)
            })
            .collect()
    }

    fn snap_synapses_to_dendrogram(&mut self) {
        for index in 0..self.scene.primitives().len() {
            let Some(primitive) = self.scene.primitive_mut(index) else {
                continue;
            };
            let (diameter, length) = (primitive.radius * 2.0, primitive.length);
            for synapse in &mut primitive.synapses {
                synapse.pose = layout::dendrogram_synapse_pose(&mut self.rng, diameter, length);
            }
        }
    }

    fn apply_update(&mut self, update: &TweenUpdate) {
        match update.target {
            TweenTarget::Segment(index) => {
                if let Some(primitive) = self.scene.primitive_mut(index) {
                    apply_to_pose(&mut primitive.pose, update.attribute, update.value);
                }
            }
            TweenTarget::Synapse { segment, synapse } => {
                if let Some(cone) = self
                    .scene
                    .primitive_mut(segment)
                    .and_then(|p| p.synapses.get_mut(synapse))
                {
                    apply_to_pose(&mut cone.pose, update.attribute, update.value);
                }
            }
            TweenTarget::Camera => match (update.attribute, update.value) {
                (TweenAttribute::Position, TweenValue::Vector(v)) => self.camera.position = v,
                (TweenAttribute::LookAt, TweenValue::Vector(v)) => self.camera.controls.target = v,
                (TweenAttribute::Up, TweenValue::Vector(v)) => self.camera.up = v,
                (TweenAttribute::Zoom, TweenValue::Scalar(z)) => self.camera.zoom = z,
                _ => {}
            },
        }
    }
}

type PoseTargets = (Option<Pose>, Vec<Pose>);

fn add_pose_tweens<F>(add: &mut F, target: TweenTarget, from: &Pose, to: &Pose)
where
    F: FnMut(TweenTarget, TweenAttribute, TweenValue, TweenValue),
{
    add(
        target,
        TweenAttribute::Position,
        TweenValue::Vector(from.translation),
        TweenValue::Vector(to.translation),
    );
    add(
        target,
        TweenAttribute::Rotation,
        TweenValue::Orientation(from.rotation),
        TweenValue::Orientation(to.rotation),
    );
    add(
        target,
        TweenAttribute::Scale,
        TweenValue::Vector(from.scale),
        TweenValue::Vector(to.scale),
    );
}

fn apply_to_pose(pose: &mut Pose, attribute: TweenAttribute, value: TweenValue) {
    match (attribute, value) {
        (TweenAttribute::Position, TweenValue::Vector(v)) => pose.translation = v,
        (TweenAttribute::Rotation, TweenValue::Orientation(q)) => pose.rotation = q,
        (TweenAttribute::Scale, TweenValue::Vector(v)) => pose.scale = v,
        _ => {}
    }
}

impl Default for Viewer {
    fn default() -> Self {
        Self::new(CameraSettings::default(), 2000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tests::node;
    use crate::morphology::tests::two_section_payload;
    use crate::protocol::{MessageText, SectionInfo, SynapseSite};
    use glam::Quat;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn viewer() -> Viewer {
        Viewer::with_rng(CameraSettings::default(), 2000.0, StdRng::seed_from_u64(7))
    }

    fn loaded() -> Viewer {
        let mut viewer = viewer();
        viewer.handle(InboundMessage::Morphology(two_section_payload()));
        viewer
    }

    fn with_dendrogram() -> Viewer {
        let mut viewer = loaded();
        let root = node("soma[0]", 20.0, 1, vec![node("dend[0]", 8.0, 3, Vec::new())]);
        viewer.handle(InboundMessage::Dendrogram(root));
        viewer
    }

    #[test]
    fn session_open_resets_and_bootstraps() {
        let mut viewer = loaded();
        assert_eq!(viewer.scene().primitives().len(), 4);

        let commands = viewer.on_session_open(&Target::Model("model-42".into()));
        assert_eq!(
            commands,
            vec![
                OutboundCommand::SetModel("model-42".into()),
                OutboundCommand::GetUiData
            ]
        );
        assert!(viewer.scene().primitives().is_empty());
        assert_eq!(viewer.mode(), ViewMode::Anatomical);
    }

    #[test]
    #[tracing_test::traced_test]
    fn malformed_morphology_keeps_previous_generation() {
        let mut viewer = loaded();
        let mut payload = two_section_payload();
        if let Some(section) = payload.get_mut("dend[0]") {
            section.index = 5;
        }
        assert!(viewer.handle(InboundMessage::Morphology(payload)).is_empty());
        assert_eq!(viewer.model().generation(), 1);
        assert_eq!(viewer.scene().generation(), 1);
        assert!(logs_contain("Dropping malformed message"));
    }

    #[test]
    fn synapses_on_unknown_segments_are_skipped() {
        let mut viewer = loaded();
        let mut payload = BTreeMap::new();
        payload.insert(
            "ExpSyn".to_string(),
            vec![
                SynapseSite {
                    sec_name: "dend[0]".into(),
                    seg_idx: 1,
                },
                SynapseSite {
                    sec_name: "axon[9]".into(),
                    seg_idx: 0,
                },
            ],
        );
        let events = viewer.handle(InboundMessage::Synapses(payload));
        assert_eq!(events, vec![ViewerEvent::SynapsesAttached { count: 1 }]);
        assert_eq!(viewer.scene().synapse_count(), 1);
    }

    #[test]
    fn switch_to_dendrogram_animates_then_swaps_camera() {
        let mut viewer = with_dendrogram();
        assert!(viewer.switch_view(ViewMode::Dendrogram, 0.0));
        assert!(viewer.is_transitioning());
        assert!(!viewer.camera().controls.enabled);
        assert!(!viewer.switch_view(ViewMode::Anatomical, 10.0));

        assert!(viewer.tick(1000.0).is_empty());
        assert!(!viewer.camera().is_orthographic());

        let events = viewer.tick(2000.0);
        assert_eq!(events, vec![ViewerEvent::ViewChanged(ViewMode::Dendrogram)]);
        assert!(viewer.camera().is_orthographic());
        assert!(viewer.camera().controls.enabled);
        assert!(!viewer.camera().controls.rotate);
        assert_eq!(viewer.scene().edges().len(), 1);

        let soma = viewer.scene().primitive("soma[0]_0").unwrap();
        let placed = viewer.layout().unwrap().section("soma[0]").unwrap().segments[0];
        assert_eq!(soma.pose.translation, placed.center);
        assert_eq!(soma.pose.rotation, Quat::IDENTITY);
    }

    #[test]
    fn switch_back_restores_anatomical_pose() {
        let mut viewer = with_dendrogram();
        let original = viewer.scene().primitive("dend[0]_1").unwrap().pose;
        viewer.switch_view(ViewMode::Dendrogram, 0.0);
        viewer.tick(2000.0);
        assert!(viewer.switch_view(ViewMode::Anatomical, 3000.0));
        assert!(viewer.scene().edges().is_empty());
        viewer.tick(5000.0);

        let pose = viewer.scene().primitive("dend[0]_1").unwrap().pose;
        assert!(pose.translation.abs_diff_eq(original.translation, 1e-4));
        assert!(!viewer.camera().is_orthographic());
    }

    #[test]
    fn footprint_clamp_widens_narrow_parents() {
        let root = node("soma[0]", 20.0, 1, vec![node("dend[0]", 8.0, 3, Vec::new())]);

        let mut viewer = loaded();
        viewer.handle(InboundMessage::Dendrogram(root.clone()));
        assert!(viewer.switch_view(ViewMode::Dendrogram, 0.0));
        assert_eq!(viewer.layout().unwrap().total_width, 8.0);

        let mut viewer = loaded();
        viewer.set_layout_options(LayoutOptions {
            clamp_to_footprint: true,
            ..LayoutOptions::default()
        });
        viewer.handle(InboundMessage::Dendrogram(root));
        assert!(viewer.switch_view(ViewMode::Dendrogram, 0.0));
        assert_eq!(viewer.layout().unwrap().total_width, 20.0);
    }

    #[test]
    fn dendrogram_requires_tree() {
        let mut viewer = loaded();
        assert!(!viewer.switch_view(ViewMode::Dendrogram, 0.0));
        assert!(!viewer.is_transitioning());
    }

    #[test]
    fn hover_and_click_request_section_info() {
        let mut viewer = loaded();
        assert!(viewer.hover_segment("dend[0]_2"));
        assert!(viewer.scene().outline().visible);

        let (event, command) = viewer.click().unwrap();
        assert_eq!(
            event,
            ViewerEvent::SegmentSelected {
                section: "dend[0]".into(),
                index: 2
            }
        );
        assert_eq!(command, OutboundCommand::GetSecInfo("dend[0]".into()));

        assert!(viewer.hover_section("soma[0]"));
        assert!(viewer.hover_segment("soma[0]"));
        assert!(!viewer.hover_segment("nope"));
        assert!(!viewer.scene().outline().visible);
        assert!(viewer.click().is_none());
    }

    #[test]
    fn pointer_picks_nearest_segment() {
        let mut viewer = loaded();
        // The soma spans y in [0, 10] on the axis the camera looks along.
        let y = 5.0 / (500.0 * 35f32.to_radians().tan());
        assert_eq!(
            viewer.pointer_move(Vec2::new(0.0, y)).as_deref(),
            Some("soma[0]_0")
        );
        assert_eq!(viewer.pointer_move(Vec2::new(0.95, -0.95)), None);
        assert!(!viewer.scene().outline().visible);
    }

    #[test]
    fn simulation_round_trip() {
        let mut viewer = loaded();
        viewer.set_record_from(["dend[0]_0"]);
        let command = viewer.start_simulation();
        assert!(matches!(command, OutboundCommand::StartSimulation(ref p) if p.record_from == vec!["dend[0]_0".to_string()]));

        let events = viewer.handle(InboundMessage::SimVoltage(vec![0.1, -65.0, -60.0, -55.0, 0.0]));
        assert_eq!(events, vec![ViewerEvent::VoltageFrame { time: 0.1 }]);
        assert!(viewer.overlay().is_running());

        let events = viewer.handle(InboundMessage::SimDone(vec![
            json!(["t", "dend[0]_0"]),
            json!([0.1, -60.0]),
        ]));
        assert!(matches!(events[0], ViewerEvent::SimulationDone(_)));
        assert!(!viewer.overlay().is_running());
        assert_eq!(viewer.overlay().recording().len(), 1);
        assert_eq!(viewer.stop_simulation(), OutboundCommand::StopSimulation);
    }

    #[test]
    fn clamp_and_text_messages() {
        let mut viewer = loaded();
        assert_eq!(viewer.place_iclamp(None), None);
        assert_eq!(viewer.place_iclamp(Some("  ")), None);
        assert_eq!(
            viewer.place_iclamp(Some("dend[0]")),
            Some(OutboundCommand::SetIclamp("dend[0]".into()))
        );

        viewer.handle(InboundMessage::Iclamp(Some("dend[0]".into())));
        assert_eq!(viewer.iclamp(), Some("dend[0]"));

        viewer.handle(InboundMessage::SecInfo(SectionInfo::Text {
            txt: "dend[0] L=30".into(),
        }));
        assert_eq!(viewer.section_info(), Some("dend[0] L=30"));

        let events = viewer.handle(InboundMessage::Status(MessageText::Text("loading".into())));
        assert_eq!(events, vec![ViewerEvent::Status(Notification::new("loading"))]);
    }

    #[test]
    fn export_name_uses_model_and_clamp() {
        let mut viewer = loaded();
        viewer.on_session_open(&Target::Model("model-42".into()));
        viewer.handle(InboundMessage::Iclamp(Some("dend[3]".into())));
        let at = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            viewer.export_file_name(&at),
            "sim_model-42_2024-01-02_03-04-05_amp-dend_3-0.7nA.csv"
        );
    }

    #[test]
    fn view_mode_parses_labels() {
        assert_eq!("3d".parse::<ViewMode>().unwrap(), ViewMode::Anatomical);
        assert_eq!("Dendrogram".parse::<ViewMode>().unwrap(), ViewMode::Dendrogram);
        assert!("side".parse::<ViewMode>().is_err());
    }
}
