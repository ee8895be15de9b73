//! Wire protocol between the viewer and the simulation backend.
//!
//! Every message is a JSON envelope `{"cmd": <tag>, "data": <payload>}`. Inbound and
//! outbound tags are modelled as adjacently tagged enums so that an unknown tag or a
//! payload of the wrong shape fails to decode instead of reaching the scene.
//!
//! Decoding failures are reported as [`ViewerError::ProtocolViolation`]; callers log and
//! drop the offending message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Notification, ViewerError, ViewerResult};
use crate::params::{InitParams, SimulationParams};

/// Messages received from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Per-section segment geometry, keyed by section name.
    Morphology(MorphologyPayload),
    /// Hierarchical display tree for the section browser.
    Topology(Vec<TopologyNode>),
    /// Section tree with precomputed dendrogram dimensions.
    Dendrogram(DendrogramNode),
    /// Synapse sites grouped by synapse type.
    Synapses(SynapsesPayload),
    /// Section holding the current clamp.
    Iclamp(Option<String>),
    /// Model description, passed through untouched.
    Model(serde_json::Value),
    /// Fatal backend error.
    Error(MessageText),
    /// Non-fatal backend status.
    Status(MessageText),
    /// Final simulation traces: label row followed by value rows.
    SimDone(Vec<serde_json::Value>),
    /// One simulation step: `[time, v_seg0, v_seg1, ...]` in canonical order.
    SimVoltage(Vec<f64>),
    /// Free text describing a section.
    SecInfo(SectionInfo),
    /// Model-provided starting parameter values.
    InitParams(InitParams),
}

impl InboundMessage {
    /// Returns the wire tag of the message.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            InboundMessage::Morphology(_) => "morphology",
            InboundMessage::Topology(_) => "topology",
            InboundMessage::Dendrogram(_) => "dendrogram",
            InboundMessage::Synapses(_) => "synapses",
            InboundMessage::Iclamp(_) => "iclamp",
            InboundMessage::Model(_) => "model",
            InboundMessage::Error(_) => "error",
            InboundMessage::Status(_) => "status",
            InboundMessage::SimDone(_) => "sim_done",
            InboundMessage::SimVoltage(_) => "sim_voltage",
            InboundMessage::SecInfo(_) => "sec_info",
            InboundMessage::InitParams(_) => "init_params",
        }
    }
}

/// Commands sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Load a model by identifier.
    SetModel(String),
    /// Load a model from an archive URL.
    SetUrl(String),
    /// Request morphology, topology, dendrogram, synapses and clamp location.
    GetUiData,
    /// Move the current clamp to a section.
    SetIclamp(String),
    /// Start a simulation run.
    StartSimulation(SimulationParams),
    /// Stop the running simulation.
    StopSimulation,
    /// Request the description of a section.
    GetSecInfo(String),
}

impl OutboundCommand {
    /// Returns the wire tag of the command.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundCommand::SetModel(_) => "set_model",
            OutboundCommand::SetUrl(_) => "set_url",
            OutboundCommand::GetUiData => "get_ui_data",
            OutboundCommand::SetIclamp(_) => "set_iclamp",
            OutboundCommand::StartSimulation(_) => "start_simulation",
            OutboundCommand::StopSimulation => "stop_simulation",
            OutboundCommand::GetSecInfo(_) => "get_sec_info",
        }
    }
}

/// Geometry of one section as sent in the `morphology` payload.
///
/// Sections without 3-D points only carry `index` and `nseg`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionGeometry {
    /// Position of the section in canonical order.
    pub index: usize,
    /// Number of segments.
    pub nseg: usize,
    #[serde(default)]
    pub xcenter: Vec<f64>,
    #[serde(default)]
    pub ycenter: Vec<f64>,
    #[serde(default)]
    pub zcenter: Vec<f64>,
    #[serde(default)]
    pub xdirection: Vec<f64>,
    #[serde(default)]
    pub ydirection: Vec<f64>,
    #[serde(default)]
    pub zdirection: Vec<f64>,
    /// Per-segment diameter.
    #[serde(default)]
    pub diam: Vec<f64>,
    /// Per-segment nominal length (`L / nseg`).
    #[serde(default)]
    pub length: Vec<f64>,
    /// Per-segment 3-D extent (norm of the direction vector).
    #[serde(default)]
    pub distance: Vec<f64>,
}

/// `morphology` payload: section name to geometry.
pub type MorphologyPayload = BTreeMap<String, SectionGeometry>;

/// Node of the `topology` display tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyNode {
    /// Section name.
    pub id: String,
    #[serde(default)]
    pub children: Vec<TopologyNode>,
}

/// Node of the `dendrogram` tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DendrogramNode {
    /// Section name.
    pub name: String,
    /// Stacked height of the section's segments including padding.
    pub height: f64,
    /// Own footprint width (widest segment plus padding).
    pub width: f64,
    /// Subtree width as computed by the backend.
    #[serde(default)]
    pub total_width: f64,
    #[serde(default)]
    pub segments: Vec<DendrogramSegment>,
    /// Child sections.
    #[serde(default)]
    pub sections: Vec<DendrogramNode>,
}

/// Segment entry of a dendrogram node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DendrogramSegment {
    pub length: f64,
    pub diam: f64,
}

/// Location of one synapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynapseSite {
    /// Host section name.
    pub sec_name: String,
    /// Host segment index.
    pub seg_idx: usize,
}

/// `synapses` payload: synapse type to sites.
pub type SynapsesPayload = BTreeMap<String, Vec<SynapseSite>>;

/// Text of an `error` or `status` message.
///
/// The backend sends a bare string; a `{msg, raw}` object is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageText {
    /// Bare message string.
    Text(String),
    /// Message with optional raw detail.
    Detailed {
        msg: String,
        #[serde(default)]
        raw: Option<String>,
    },
}

impl MessageText {
    /// Converts the message into a user-facing notification.
    #[must_use]
    pub fn into_notification(self) -> Notification {
        match self {
            MessageText::Text(msg) => Notification::new(msg),
            MessageText::Detailed { msg, raw } => Notification { msg, raw },
        }
    }
}

/// Payload of `sec_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionInfo {
    /// `{"txt": ...}` object.
    Text { txt: String },
    /// Bare string.
    Raw(String),
}

impl SectionInfo {
    /// Returns the description text.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            SectionInfo::Text { txt } => txt,
            SectionInfo::Raw(txt) => txt,
        }
    }
}

/// Decodes one inbound wire message.
pub fn decode(text: &str) -> ViewerResult<InboundMessage> {
    serde_json::from_str(text).map_err(|e| ViewerError::ProtocolViolation(e.to_string()))
}

/// Encodes one outbound command.
pub fn encode(command: &OutboundCommand) -> ViewerResult<String> {
    Ok(serde_json::to_string(command)?)
}
