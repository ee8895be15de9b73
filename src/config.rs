//! Configuration loading using Figment
//!
//! Configuration is merged from, in increasing priority:
//! 1. Built-in defaults
//! 2. A TOML file (`nrn-viewer.toml` unless another path is given)
//! 3. Environment variables prefixed with `NRN_VIEWER_`, nested keys separated by `__`
//!    (for example `NRN_VIEWER_SESSION__BASE_URL`)
//!
//! # Example
//! ```no_run
//! use nrn_viewer::config::ViewerConfig;
//!
//! let config = ViewerConfig::load()?;
//! config.validate()?;
//! println!("Backend: {}", config.session.base_url);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::camera::CameraSettings;
use crate::error::{ViewerError, ViewerResult};
use crate::layout::LayoutOptions;
use crate::transport::{socket, BackoffPolicy, SessionOptions};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "nrn-viewer.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Backend session settings
    #[serde(default)]
    pub session: SessionConfig,
    /// View and animation settings
    #[serde(default)]
    pub view: ViewConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Backend session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL of the simulation backend (http, https, ws or wss)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path of the WebSocket endpoint relative to the base URL
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Close the session after this long without traffic
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Minimum pause before each connection attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Jitter window of the first attempt
    #[serde(default = "default_initial_jitter")]
    pub backoff_initial_jitter_ms: u64,
    /// Growth of the jitter window per attempt
    #[serde(default = "default_jitter_step")]
    pub backoff_jitter_step_ms: u64,
    /// Upper bound of the jitter window
    #[serde(default = "default_jitter_cap")]
    pub backoff_jitter_cap_ms: u64,
    /// Attempts per connect cycle before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Give up on one connection attempt after this long
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_path: default_ws_path(),
            idle_timeout_ms: default_idle_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_initial_jitter_ms: default_initial_jitter(),
            backoff_jitter_step_ms: default_jitter_step(),
            backoff_jitter_cap_ms: default_jitter_cap(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// View configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Duration of the view-switch animation
    #[serde(default = "default_tween_duration")]
    pub tween_duration_ms: u64,
    /// Visible height of the dendrogram view
    #[serde(default = "default_frustum_size")]
    pub frustum_size: f32,
    /// Camera distance from the origin
    #[serde(default = "default_camera_distance")]
    pub camera_distance: f32,
    /// Vertical field of view of the 3-D camera in degrees
    #[serde(default = "default_fov")]
    pub fov_deg: f32,
    /// Interval between animation frames
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    /// Keep dendrogram parents at least as wide as their own footprint
    #[serde(default)]
    pub clamp_dendrogram: bool,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            tween_duration_ms: default_tween_duration(),
            frustum_size: default_frustum_size(),
            camera_distance: default_camera_distance(),
            fov_deg: default_fov(),
            frame_interval_ms: default_frame_interval(),
            clamp_dendrogram: false,
        }
    }
}

fn default_name() -> String {
    "nrn-viewer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_idle_timeout() -> u64 {
    300_000
}

fn default_backoff_base() -> u64 {
    2_000
}

fn default_initial_jitter() -> u64 {
    500
}

fn default_jitter_step() -> u64 {
    2
}

fn default_jitter_cap() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    20
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_tween_duration() -> u64 {
    2_000
}

fn default_frustum_size() -> f32 {
    670.0
}

fn default_camera_distance() -> f32 {
    500.0
}

fn default_fov() -> f32 {
    70.0
}

fn default_frame_interval() -> u64 {
    16
}

impl ViewerConfig {
    /// Load configuration from the default file and environment.
    pub fn load() -> ViewerResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ViewerResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(ViewerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("NRN_VIEWER_").split("__"))
    }

    /// Validate configuration values.
    pub fn validate(&self) -> ViewerResult<()> {
        self.check().map_err(ViewerError::Configuration)
    }

    fn check(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.session.max_attempts == 0 {
            return Err("session.max_attempts must be greater than 0".to_string());
        }

        if self.session.backoff_jitter_cap_ms < self.session.backoff_initial_jitter_ms {
            return Err(format!(
                "session.backoff_jitter_cap_ms ({}) must not be below backoff_initial_jitter_ms ({})",
                self.session.backoff_jitter_cap_ms, self.session.backoff_initial_jitter_ms
            ));
        }

        if self.session.connect_timeout_ms == 0 {
            return Err("session.connect_timeout_ms must be greater than 0".to_string());
        }

        if let Err(e) = Url::parse(&self.session.base_url) {
            return Err(format!(
                "Invalid session.base_url '{}': {}",
                self.session.base_url, e
            ));
        }

        if self.view.frame_interval_ms == 0 {
            return Err("view.frame_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Retry pacing described by the session section.
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.session.backoff_base_ms),
            initial_jitter: Duration::from_millis(self.session.backoff_initial_jitter_ms),
            jitter_step: Duration::from_millis(self.session.backoff_jitter_step_ms),
            jitter_cap: Duration::from_millis(self.session.backoff_jitter_cap_ms),
            max_attempts: self.session.max_attempts,
        }
    }

    /// Session options for the configured backend.
    pub fn session_options(&self) -> ViewerResult<SessionOptions> {
        let endpoint = socket::endpoint(&self.session.base_url, &self.session.ws_path)?;
        Ok(SessionOptions {
            endpoint,
            policy: self.backoff_policy(),
            idle_timeout: Duration::from_millis(self.session.idle_timeout_ms),
        })
    }

    /// Time allowed for one WebSocket handshake.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }

    /// Dendrogram layout tuning described by the view section.
    #[must_use]
    pub fn layout_options(&self) -> LayoutOptions {
        LayoutOptions {
            clamp_to_footprint: self.view.clamp_dendrogram,
            ..LayoutOptions::default()
        }
    }

    /// Camera settings described by the view section.
    #[must_use]
    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            fov_deg: self.view.fov_deg,
            distance: self.view.camera_distance,
            frustum_size: self.view.frustum_size,
            ..CameraSettings::default()
        }
    }

    /// Duration of the view-switch animation.
    #[must_use]
    pub fn tween_duration(&self) -> Duration {
        Duration::from_millis(self.view.tween_duration_ms)
    }

    /// Interval between animation frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.view.frame_interval_ms)
    }
}
