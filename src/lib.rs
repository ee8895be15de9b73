//! # NEURON Morphology Viewer Core Library
//!
//! This crate streams a simulated neuron from a remote simulation backend and keeps a
//! renderable scene of it up to date: the 3-D morphology, an alternate dendrogram layout,
//! synapse markers and a live voltage overlay. The binary (`main.rs`) drives it headless;
//! graphical front ends plug in through [`app::Renderer`].
//!
//! ## Crate Structure
//!
//! - **`transport`**: The resilient session: one WebSocket connection with jittered
//!   retries, an idle watchdog and typed lifecycle events.
//! - **`protocol`**: The `{cmd, data}` wire envelope and the inbound/outbound message types.
//! - **`morphology`**: Sections, segments and the canonical segment order used by voltage
//!   frames.
//! - **`scene`**: Cylinder primitives, synapse cones, the hover outline and ray picking.
//! - **`layout`**: Dendrogram coordinates and the 3-D target poses.
//! - **`tween`** and **`camera`**: Animated view transitions and the two projections.
//! - **`overlay`**: Voltage coloring and the recording buffer.
//! - **`params`** and **`export`**: Simulation parameters and CSV export of results.
//! - **`viewer`**: Applies inbound messages to the scene and turns user actions into
//!   commands.
//! - **`app`**: The async loop tying the session and the viewer together.
//! - **`config`**, **`tracing_setup`** and **`error`**: Configuration, logging and the
//!   error hierarchy.

pub mod app;
pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod layout;
pub mod morphology;
pub mod overlay;
pub mod params;
pub mod protocol;
pub mod scene;
pub mod tracing_setup;
pub mod transport;
pub mod tween;
pub mod viewer;

pub use error::{Notification, ViewerError, ViewerResult};
