//! Live voltage overlay.
//!
//! While a simulation runs, each `sim_voltage` frame recolors every segment between its
//! resting color and the spike color. Normalization uses running bounds that start at
//! -70 / 20 mV for every run and only ever widen. Values for the recorded segments are
//! appended to a [`RecordingBuffer`] that stays readable after the run stops.

use tracing::{debug, trace};

use crate::error::{ViewerError, ViewerResult};
use crate::morphology::MorphologyModel;
use crate::scene::{palette, Scene};

/// Lower normalization bound at run start, in mV.
pub const RESTING_MIN: f64 = -70.0;
/// Upper normalization bound at run start, in mV.
pub const RESTING_MAX: f64 = 20.0;

/// Running voltage normalization bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for VoltageBounds {
    fn default() -> Self {
        Self {
            min: RESTING_MIN,
            max: RESTING_MAX,
        }
    }
}

impl VoltageBounds {
    /// Widens the bounds to include `v`.
    pub fn widen(&mut self, v: f64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    /// Position of `v` within the bounds, clamped to `[0, 1]`.
    #[must_use]
    pub fn normalize(&self, v: f64) -> f32 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        ((v - self.min) / span).clamp(0.0, 1.0) as f32
    }
}

/// One row of recorded values.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRow {
    /// Simulation time in ms.
    pub time: f64,
    /// One value per recording site; `None` if the site is not part of the morphology.
    pub values: Vec<Option<f64>>,
}

/// Recorded traces of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingBuffer {
    sites: Vec<String>,
    rows: Vec<RecordingRow>,
}

impl RecordingBuffer {
    /// Recording site names, in column order.
    #[must_use]
    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    /// Recorded rows in arrival order.
    #[must_use]
    pub fn rows(&self) -> &[RecordingRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn reset(&mut self, sites: &[String]) {
        self.sites = sites.to_vec();
        self.rows.clear();
    }
}

/// Voltage overlay state.
#[derive(Debug, Default)]
pub struct VoltageOverlay {
    running: bool,
    bounds: VoltageBounds,
    record_from: Vec<String>,
    site_slots: Option<Vec<Option<usize>>>,
    recording: RecordingBuffer,
    history: Vec<Vec<f64>>,
}

impl VoltageOverlay {
    /// Creates an idle overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current normalization bounds.
    #[must_use]
    pub fn bounds(&self) -> VoltageBounds {
        self.bounds
    }

    /// Recorded traces.
    #[must_use]
    pub fn recording(&self) -> &RecordingBuffer {
        &self.recording
    }

    /// Number of frames stored for [`show_gradient_at`](Self::show_gradient_at).
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Sets the segments recorded from the next run on.
    pub fn set_record_from(&mut self, sites: &[String]) {
        self.record_from = sites.to_vec();
        self.site_slots = None;
    }

    /// Starts a run: resets bounds, clears the recording buffer and the frame history.
    pub fn start_run(&mut self) {
        self.running = true;
        self.bounds = VoltageBounds::default();
        self.recording.reset(&self.record_from);
        self.history.clear();
        self.site_slots = None;
        debug!(sites = self.record_from.len(), "Voltage overlay run started");
    }

    /// Stops the run and reverts every segment to its resting color.
    ///
    /// The recording buffer stays readable until the next run starts.
    pub fn stop_run(&mut self, scene: &mut Scene) {
        if self.running {
            debug!(frames = self.history.len(), "Voltage overlay run stopped");
        }
        self.running = false;
        scene.reset_colors();
    }

    /// Applies one `[time, v0, v1, ...]` frame.
    ///
    /// The first frame after a stop starts a new run. A frame whose length does not match
    /// the canonical segment order, or that carries a non-finite value, is rejected
    /// without touching any color.
    pub fn apply_frame(
        &mut self,
        frame: &[f64],
        model: &MorphologyModel,
        scene: &mut Scene,
    ) -> ViewerResult<()> {
        let expected = model.canonical_len() + 1;
        if frame.len() != expected {
            return Err(ViewerError::ProtocolViolation(format!(
                "voltage frame has {} values, expected {}",
                frame.len(),
                expected
            )));
        }
        if scene.generation() != model.generation() || scene.slot_count() != model.canonical_len() {
            return Err(ViewerError::ProtocolViolation(
                "scene is out of date with the morphology".into(),
            ));
        }
        if let Some(bad) = frame.iter().position(|v| !v.is_finite()) {
            return Err(ViewerError::ProtocolViolation(format!(
                "voltage frame has a non-finite value at position {bad}"
            )));
        }

        if !self.running {
            self.start_run();
        }

        let (time, voltages) = (frame[0], &frame[1..]);
        for &v in voltages {
            self.bounds.widen(v);
        }
        self.paint(voltages, scene);

        let slots = self.site_slots.get_or_insert_with(|| {
            self.record_from
                .iter()
                .map(|site| model.canonical_index_of(site))
                .collect()
        });
        let values = slots
            .iter()
            .map(|slot| slot.map(|i| voltages[i]))
            .collect();
        self.recording.rows.push(RecordingRow { time, values });
        self.history.push(frame.to_vec());

        trace!(time, min = self.bounds.min, max = self.bounds.max, "Applied voltage frame");
        Ok(())
    }

    /// Recolors the scene from the first stored frame at or after `time`.
    ///
    /// Uses the current bounds and leaves the recording buffer alone. Returns `false` if no
    /// stored frame qualifies.
    pub fn show_gradient_at(&self, time: f64, scene: &mut Scene) -> bool {
        let Some(frame) = self.history.iter().find(|f| f[0] >= time) else {
            return false;
        };
        if frame.len() != scene.slot_count() + 1 {
            debug!("Stored frame no longer matches the scene");
            return false;
        }
        self.paint(&frame[1..], scene);
        true
    }

    fn paint(&self, voltages: &[f64], scene: &mut Scene) {
        let spike = palette::spike();
        for (slot, &v) in voltages.iter().enumerate() {
            if let Some(resting) = scene.slot_resting_color(slot) {
                scene.set_slot_color(slot, resting.lerp(spike, self.bounds.normalize(v)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morphology::tests::two_section_payload;

    fn setup() -> (MorphologyModel, Scene, VoltageOverlay) {
        let mut model = MorphologyModel::new();
        model.load(&two_section_payload()).unwrap();
        let mut scene = Scene::new();
        scene.rebuild(&model);
        (model, scene, VoltageOverlay::new())
    }

    #[test]
    fn frame_recolors_and_records() {
        let (model, mut scene, mut overlay) = setup();
        overlay.set_record_from(&["dend[0]_2".to_string(), "nope_0".to_string()]);

        overlay
            .apply_frame(&[0.1, -70.0, 20.0, -25.0, 0.0], &model, &mut scene)
            .unwrap();
        assert!(overlay.is_running());
        assert_eq!(scene.slot_color(0), scene.slot_resting_color(0));
        assert_eq!(scene.slot_color(1).unwrap().to_hex(), palette::SPIKE);

        let row = &overlay.recording().rows()[0];
        assert_eq!(row.time, 0.1);
        assert_eq!(row.values, vec![Some(0.0), None]);
    }

    #[test]
    fn wrong_length_frame_leaves_colors_alone() {
        let (model, mut scene, mut overlay) = setup();
        let before: Vec<_> = scene.primitives().iter().map(|p| p.color).collect();

        let err = overlay
            .apply_frame(&[0.1, -65.0, -60.0], &model, &mut scene)
            .unwrap_err();
        assert!(matches!(err, ViewerError::ProtocolViolation(_)));
        assert!(overlay
            .apply_frame(&[0.1, -65.0, f64::NAN, -60.0, -60.0], &model, &mut scene)
            .is_err());

        let after: Vec<_> = scene.primitives().iter().map(|p| p.color).collect();
        assert_eq!(before, after);
        assert!(!overlay.is_running());
    }

    #[test]
    fn bounds_only_widen_within_a_run() {
        let (model, mut scene, mut overlay) = setup();
        overlay
            .apply_frame(&[0.0, -90.0, 40.0, 0.0, 0.0], &model, &mut scene)
            .unwrap();
        overlay
            .apply_frame(&[0.1, -60.0, 0.0, 0.0, 0.0], &model, &mut scene)
            .unwrap();
        assert_eq!(overlay.bounds(), VoltageBounds { min: -90.0, max: 40.0 });

        overlay.stop_run(&mut scene);
        assert_eq!(scene.slot_color(1), scene.slot_resting_color(1));
        assert_eq!(overlay.recording().len(), 2);

        overlay
            .apply_frame(&[0.0, -60.0, 0.0, 0.0, 0.0], &model, &mut scene)
            .unwrap();
        assert_eq!(overlay.bounds(), VoltageBounds::default());
        assert_eq!(overlay.recording().len(), 1);
    }

    #[test]
    fn gradient_uses_first_frame_at_or_after_time() {
        let (model, mut scene, mut overlay) = setup();
        overlay
            .apply_frame(&[1.0, 20.0, 20.0, 20.0, 20.0], &model, &mut scene)
            .unwrap();
        overlay
            .apply_frame(&[2.0, -70.0, -70.0, -70.0, -70.0], &model, &mut scene)
            .unwrap();
        overlay.stop_run(&mut scene);

        assert!(overlay.show_gradient_at(0.5, &mut scene));
        assert_eq!(scene.slot_color(0).unwrap().to_hex(), palette::SPIKE);
        assert!(overlay.show_gradient_at(1.5, &mut scene));
        assert_eq!(scene.slot_color(0), scene.slot_resting_color(0));
        assert!(!overlay.show_gradient_at(5.0, &mut scene));
        assert_eq!(overlay.recording().len(), 2);
    }
}
