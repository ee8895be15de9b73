//! Simulation parameters sent with `start_simulation`.
//!
//! The defaults match the backend's stock current-step protocol. A model may ship its own
//! starting values; they arrive once as an `init_params` message and are applied with
//! [`SimulationParams::apply_init_params`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum number of segments that can be recorded in one run.
pub const MAX_RECORDING_SITES: usize = 10;

/// Segment recorded when the user has not chosen any.
pub const DEFAULT_RECORDING_SITE: &str = "soma[0]_0";

/// Parameter object for the `start_simulation` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Temperature in °C.
    pub celsius: f64,
    /// Simulation end time in ms.
    pub tstop: f64,
    /// Stimulus onset in ms.
    pub delay: f64,
    /// Stimulus duration in ms.
    pub dur: f64,
    /// Stimulus amplitude in nA.
    pub amp: f64,
    /// Holding current in nA.
    pub hypamp: f64,
    /// Fixed time step in ms, `None` for variable time step.
    pub dt: Option<f64>,
    /// Initial membrane voltage in mV.
    pub vinit: f64,
    /// Segment names (`section_index`) to record.
    #[serde(rename = "recordFrom")]
    pub record_from: Vec<String>,
    #[serde(skip)]
    initialized: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            celsius: 34.0,
            tstop: 1000.0,
            delay: 100.0,
            dur: 800.0,
            amp: 0.7,
            hypamp: 0.0,
            dt: None,
            vinit: -73.0,
            record_from: vec![DEFAULT_RECORDING_SITE.to_string()],
            initialized: false,
        }
    }
}

/// Model-provided starting values from the `init_params` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    #[serde(default)]
    pub celsius: Option<f64>,
    #[serde(default)]
    pub tstop: Option<f64>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub dur: Option<f64>,
    #[serde(default)]
    pub amp: Option<f64>,
    #[serde(default)]
    pub hypamp: Option<f64>,
    #[serde(default)]
    pub dt: Option<f64>,
    #[serde(default)]
    pub vinit: Option<f64>,
}

impl SimulationParams {
    /// Returns `true` once model-provided values have been applied.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns `true` if a fixed time step is configured.
    #[must_use]
    pub fn is_fixed_dt(&self) -> bool {
        self.dt.is_some()
    }

    /// Applies model-provided values. Only the first payload carrying any value is used.
    ///
    /// Returns `true` if the parameters changed.
    pub fn apply_init_params(&mut self, init: &InitParams) -> bool {
        if self.initialized {
            return false;
        }

        let mut applied = false;
        let mut take = |slot: &mut f64, value: Option<f64>| {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                *slot = v;
                applied = true;
            }
        };
        take(&mut self.hypamp, init.hypamp);
        take(&mut self.vinit, init.vinit);
        take(&mut self.tstop, init.tstop);
        take(&mut self.delay, init.delay);
        take(&mut self.dur, init.dur);
        take(&mut self.amp, init.amp);
        take(&mut self.celsius, init.celsius);

        // A missing dt always means variable time step.
        self.dt = init.dt.filter(|v| v.is_finite());
        applied |= self.dt.is_some();

        self.initialized = applied;
        applied
    }

    /// Replaces the recording sites, keeping at most [`MAX_RECORDING_SITES`].
    ///
    /// Returns the number of sites that were dropped.
    pub fn set_record_from<I, S>(&mut self, sites: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sites: Vec<String> = sites
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.trim().is_empty())
            .collect();
        let dropped = sites.len().saturating_sub(MAX_RECORDING_SITES);
        if dropped > 0 {
            warn!(
                dropped,
                "Too many recording sites, only the first {} will be used", MAX_RECORDING_SITES
            );
            sites.truncate(MAX_RECORDING_SITES);
        }
        self.record_from = sites;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize_with_wire_names() {
        let json = serde_json::to_value(SimulationParams::default()).unwrap();
        assert_eq!(json["celsius"], 34.0);
        assert_eq!(json["recordFrom"][0], "soma[0]_0");
        assert!(json["dt"].is_null());
        assert!(json.get("initialized").is_none());
    }

    #[test]
    fn init_params_apply_only_once() {
        let mut params = SimulationParams::default();
        let first = InitParams {
            amp: Some(1.5),
            dt: Some(0.025),
            ..Default::default()
        };
        assert!(params.apply_init_params(&first));
        assert_eq!(params.amp, 1.5);
        assert_eq!(params.dt, Some(0.025));
        assert!(params.is_fixed_dt());

        let second = InitParams {
            amp: Some(9.0),
            ..Default::default()
        };
        assert!(!params.apply_init_params(&second));
        assert_eq!(params.amp, 1.5);
    }

    #[test]
    fn empty_init_params_keep_defaults_and_stay_open() {
        let mut params = SimulationParams::default();
        assert!(!params.apply_init_params(&InitParams::default()));
        assert!(!params.is_initialized());
        assert_eq!(params.vinit, -73.0);
        assert!(params.dt.is_none());
    }

    #[test]
    fn recording_sites_are_capped() {
        let mut params = SimulationParams::default();
        let sites: Vec<String> = (0..12).map(|i| format!("dend[{i}]_0")).collect();
        assert_eq!(params.set_record_from(sites), 2);
        assert_eq!(params.record_from.len(), MAX_RECORDING_SITES);
        assert_eq!(params.record_from[9], "dend[9]_0");
    }
}
