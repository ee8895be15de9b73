//! Wire messages through the viewer: morphology, dendrogram layout, voltage overlay and
//! export.

use nrn_viewer::layout::{compute_dendrogram, LayoutOptions};
use nrn_viewer::overlay::{RESTING_MAX, RESTING_MIN};
use nrn_viewer::protocol::{self, InboundMessage};
use nrn_viewer::viewer::{ViewMode, Viewer, ViewerEvent};
use serde_json::json;

fn message(cmd: &str, data: serde_json::Value) -> InboundMessage {
    protocol::decode(&json!({ "cmd": cmd, "data": data }).to_string()).unwrap()
}

/// One section with three segments stacked along +Y.
fn single_dendrite() -> InboundMessage {
    message(
        "morphology",
        json!({
            "dend[0]": {
                "index": 0,
                "nseg": 3,
                "xcenter": [0.0, 0.0, 0.0],
                "ycenter": [5.0, 15.0, 25.0],
                "zcenter": [0.0, 0.0, 0.0],
                "xdirection": [0.0, 0.0, 0.0],
                "ydirection": [10.0, 10.0, 10.0],
                "zdirection": [0.0, 0.0, 0.0],
                "diam": [2.0, 2.0, 2.0],
                "length": [10.0, 10.0, 10.0],
                "distance": [10.0, 10.0, 10.0]
            }
        }),
    )
}

fn tree() -> serde_json::Value {
    let segment = json!({ "length": 10.0, "diam": 2.0 });
    json!({
        "name": "soma[0]",
        "height": 12.0,
        "width": 24.0,
        "total_width": 36.0,
        "segments": [segment],
        "sections": [
            {
                "name": "dend[0]",
                "height": 12.0,
                "width": 12.0,
                "segments": [segment],
                "sections": [
                    { "name": "dend[1]", "height": 12.0, "width": 8.0, "segments": [segment] },
                    { "name": "dend[2]", "height": 12.0, "width": 4.0, "segments": [segment] }
                ]
            },
            { "name": "axon[0]", "height": 12.0, "width": 24.0, "segments": [segment] }
        ]
    })
}

fn loaded() -> Viewer {
    let mut viewer = Viewer::default();
    let events = viewer.handle(single_dendrite());
    assert!(matches!(
        events.as_slice(),
        [ViewerEvent::MorphologyLoaded { sections: 1, primitives: 3, .. }]
    ));
    viewer
}

fn colors(viewer: &Viewer) -> Vec<u32> {
    viewer
        .scene()
        .primitives()
        .iter()
        .map(|p| p.color.to_hex())
        .collect()
}

#[test]
fn voltage_frame_recolors_every_segment() {
    let mut viewer = loaded();
    let resting = colors(&viewer);

    let events = viewer.handle(message("sim_voltage", json!([0.1, -65, -60, -55])));
    assert_eq!(events, vec![ViewerEvent::VoltageFrame { time: 0.1 }]);

    let painted = colors(&viewer);
    assert_eq!(painted.len(), 3);
    for (before, after) in resting.iter().zip(&painted) {
        assert_ne!(before, after);
    }
    assert_ne!(painted[0], painted[1]);
    assert_ne!(painted[1], painted[2]);
}

#[test]
fn wrong_length_frame_is_ignored() {
    let mut viewer = loaded();
    viewer.handle(message("sim_voltage", json!([0.1, -65, -60, -55])));
    let before = colors(&viewer);

    assert!(viewer
        .handle(message("sim_voltage", json!([0.2, -50, -40])))
        .is_empty());
    assert_eq!(colors(&viewer), before);
    assert_eq!(viewer.overlay().history_len(), 1);
}

#[test]
fn voltage_bounds_only_widen() {
    let mut viewer = loaded();
    viewer.handle(message("sim_voltage", json!([0.1, -80, -60, 35])));
    let bounds = viewer.overlay().bounds();
    assert_eq!((bounds.min, bounds.max), (-80.0, 35.0));

    viewer.handle(message("sim_voltage", json!([0.2, -65, -65, -65])));
    assert_eq!(viewer.overlay().bounds(), bounds);

    // A new run starts again from the resting window.
    viewer.start_simulation();
    let bounds = viewer.overlay().bounds();
    assert_eq!((bounds.min, bounds.max), (RESTING_MIN, RESTING_MAX));
}

#[test]
fn dendrogram_width_is_sum_of_leaves() {
    let InboundMessage::Dendrogram(root) = message("dendrogram", tree()) else {
        panic!("expected a dendrogram message");
    };
    let options = LayoutOptions::default();
    let layout = compute_dendrogram(&root, &options);

    assert_eq!(layout.total_width, 8.0 + 4.0 + 24.0);
    assert_eq!(layout.sections.len(), 5);
    assert_eq!(layout.edges.len(), 4);

    let soma = layout.section("soma[0]").unwrap();
    assert_eq!(soma.center_x, 0.0);
    let dend = layout.section("dend[0]").unwrap();
    assert_eq!(dend.total_width, 12.0);
    assert_eq!(dend.left, -18.0);
    assert_eq!(layout.section("axon[0]").unwrap().left, -6.0);

    // Children sit on top of their parent.
    assert_eq!(dend.base, soma.base + 12.0);
    assert_eq!(layout, compute_dendrogram(&root, &options));
}

#[test]
fn dendrogram_message_enables_view_switch() {
    let mut viewer = loaded();
    assert!(!viewer.switch_view(ViewMode::Dendrogram, 0.0));

    let tree = json!({
        "name": "dend[0]",
        "height": 36.0,
        "width": 4.0,
        "segments": [
            { "length": 10.0, "diam": 2.0 },
            { "length": 10.0, "diam": 2.0 },
            { "length": 10.0, "diam": 2.0 }
        ]
    });
    let events = viewer.handle(message("dendrogram", tree));
    assert_eq!(
        events,
        vec![ViewerEvent::DendrogramLoaded {
            root: "dend[0]".into()
        }]
    );

    assert!(viewer.switch_view(ViewMode::Dendrogram, 0.0));
    let mut now = 0.0;
    let mut changed = Vec::new();
    while viewer.is_transitioning() {
        now += 100.0;
        changed.extend(viewer.tick(now));
    }
    assert_eq!(changed, vec![ViewerEvent::ViewChanged(ViewMode::Dendrogram)]);
    assert_eq!(viewer.mode(), ViewMode::Dendrogram);
}

#[test]
fn finished_run_exports_csv() {
    let mut viewer = loaded();
    viewer.set_record_from(["dend[0]_1"]);
    viewer.start_simulation();
    viewer.handle(message("sim_voltage", json!([0.1, -65, -60, -55])));

    let events = viewer.handle(message(
        "sim_done",
        json!([["t", "dend[0]_1"], [0.0, -65.0], [0.1, -60.0], [0.2, null]]),
    ));
    assert!(matches!(events.as_slice(), [ViewerEvent::SimulationDone(_)]));
    assert_eq!(viewer.overlay().recording().rows()[0].values, vec![Some(-60.0)]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sim.csv");
    viewer.simulation_result().unwrap().save(&path).unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = written.lines().collect();
    assert_eq!(lines[0], "index,t,dend[0]_1");
    assert_eq!(lines[1], "0,0,-65");
    assert_eq!(lines[3], "2,0.2,");
    assert_eq!(lines.len(), 4);
}
