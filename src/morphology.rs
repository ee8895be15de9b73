//! In-memory neuron morphology.
//!
//! A [`MorphologyModel`] holds one generation of sections and segments. Each `morphology`
//! payload replaces the whole tree; segment references obtained from an earlier generation
//! must not be used afterwards, which callers detect through [`MorphologyModel::generation`].
//!
//! Voltage frames address segments in canonical order: sections by their `index`, and
//! segments by position within their section. [`MorphologyModel::canonical_len`] always
//! equals the sum of `nseg` over all sections.

use std::collections::HashMap;

use glam::Vec3;
use tracing::{debug, info};

use crate::error::{ViewerError, ViewerResult};
use crate::protocol::{DendrogramNode, MorphologyPayload, SectionGeometry, TopologyNode};

/// 3-D geometry of one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentGeometry {
    /// Midpoint of the segment.
    pub center: Vec3,
    /// Vector from the segment start to its end.
    pub direction: Vec3,
    /// Diameter in µm.
    pub diameter: f32,
    /// Nominal length (`L / nseg`).
    pub length: f32,
    /// Length of the 3-D path covered by the segment.
    pub distance: f32,
}

/// Leaf unit of anatomy.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position within the section.
    pub index: usize,
    /// `None` for sections without 3-D points.
    pub geometry: Option<SegmentGeometry>,
}

/// A named, unbranched piece of the neuron.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Stable name such as `dend[3]`.
    pub name: String,
    /// Position in canonical order.
    pub index: usize,
    /// Segments in order.
    pub segments: Vec<Segment>,
    /// Child section names, from the dendrogram tree.
    pub children: Vec<String>,
    /// Parent section name, from the dendrogram tree.
    pub parent: Option<String>,
}

impl Section {
    /// Number of segments.
    #[must_use]
    pub fn nseg(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if the section has 3-D geometry.
    #[must_use]
    pub fn has_geometry(&self) -> bool {
        self.segments.iter().any(|s| s.geometry.is_some())
    }
}

/// Position of a segment inside the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    /// Section position (equal to the section's `index`).
    pub section: usize,
    /// Segment index within the section.
    pub segment: usize,
}

/// One generation of the neuron's morphology.
#[derive(Debug, Default)]
pub struct MorphologyModel {
    generation: u64,
    sections: Vec<Section>,
    by_name: HashMap<String, usize>,
    canonical: Vec<SegmentRef>,
    canonical_start: Vec<usize>,
    dendrogram: Option<DendrogramNode>,
    topology: Vec<TopologyNode>,
}

impl MorphologyModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation counter, bumped by every successful [`load`](Self::load).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` before the first morphology has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections in canonical order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Looks up a section by name.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.by_name.get(name).map(|&i| &self.sections[i])
    }

    /// Dendrogram tree of the current generation, if received.
    #[must_use]
    pub fn dendrogram(&self) -> Option<&DendrogramNode> {
        self.dendrogram.as_ref()
    }

    /// Display tree of the current generation.
    #[must_use]
    pub fn topology(&self) -> &[TopologyNode] {
        &self.topology
    }

    /// Replaces the whole tree with a new payload.
    ///
    /// The payload is validated before anything is replaced; on error the previous
    /// generation stays intact. Returns the new generation.
    pub fn load(&mut self, payload: &MorphologyPayload) -> ViewerResult<u64> {
        let mut sections = Vec::with_capacity(payload.len());
        for (name, geometry) in payload {
            sections.push(build_section(name, geometry)?);
        }
        sections.sort_by_key(|s| s.index);
        for (position, section) in sections.iter().enumerate() {
            if section.index != position {
                return Err(ViewerError::ProtocolViolation(format!(
                    "section indices are not contiguous: '{}' has index {} at position {}",
                    section.name, section.index, position
                )));
            }
        }

        self.by_name = sections
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        self.sections = sections;
        self.dendrogram = None;
        self.topology.clear();
        self.generation += 1;
        self.recompute_canonical_order();

        info!(
            generation = self.generation,
            sections = self.sections.len(),
            segments = self.canonical.len(),
            "Loaded morphology"
        );
        Ok(self.generation)
    }

    /// Rebuilds the canonical segment order from the section segment counts.
    pub fn recompute_canonical_order(&mut self) {
        self.canonical.clear();
        self.canonical_start.clear();
        for (position, section) in self.sections.iter().enumerate() {
            self.canonical_start.push(self.canonical.len());
            self.canonical
                .extend((0..section.nseg()).map(|segment| SegmentRef {
                    section: position,
                    segment,
                }));
        }
    }

    /// Number of segments in canonical order.
    #[must_use]
    pub fn canonical_len(&self) -> usize {
        self.canonical.len()
    }

    /// Canonical segment order.
    #[must_use]
    pub fn canonical_order(&self) -> &[SegmentRef] {
        &self.canonical
    }

    /// Canonical index of a segment.
    #[must_use]
    pub fn canonical_index(&self, section: &str, segment: usize) -> Option<usize> {
        let position = *self.by_name.get(section)?;
        if segment >= self.sections[position].nseg() {
            return None;
        }
        Some(self.canonical_start[position] + segment)
    }

    /// Canonical index of a segment given by name (`dend[3]_2`).
    #[must_use]
    pub fn canonical_index_of(&self, segment_name: &str) -> Option<usize> {
        let (section, segment) = parse_segment_name(segment_name)?;
        self.canonical_index(section, segment)
    }

    /// Resolves a segment reference.
    #[must_use]
    pub fn segment(&self, at: SegmentRef) -> Option<(&Section, &Segment)> {
        let section = self.sections.get(at.section)?;
        Some((section, section.segments.get(at.segment)?))
    }

    /// Resolves a segment by section name and index.
    #[must_use]
    pub fn find_segment(&self, section: &str, segment: usize) -> Option<(&Section, &Segment)> {
        let position = *self.by_name.get(section)?;
        self.segment(SegmentRef {
            section: position,
            segment,
        })
    }

    /// Stores the dendrogram tree and links parents and children by name.
    ///
    /// Names unknown to the current generation are kept in the tree but not linked.
    pub fn load_dendrogram(&mut self, root: DendrogramNode) {
        for section in &mut self.sections {
            section.children.clear();
            section.parent = None;
        }
        self.link(&root, None);
        debug!(root = %root.name, "Loaded dendrogram");
        self.dendrogram = Some(root);
    }

    fn link(&mut self, node: &DendrogramNode, parent: Option<&str>) {
        if let Some(&position) = self.by_name.get(&node.name) {
            let section = &mut self.sections[position];
            section.parent = parent.map(str::to_string);
            section.children = node.sections.iter().map(|c| c.name.clone()).collect();
        }
        for child in &node.sections {
            self.link(child, Some(&node.name));
        }
    }

    /// Stores the display tree.
    pub fn load_topology(&mut self, topology: Vec<TopologyNode>) {
        self.topology = topology;
    }
}

/// Splits a segment name such as `dend[3]_2` into section name and index.
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<(&str, usize)> {
    let (section, index) = name.rsplit_once('_')?;
    if section.is_empty() {
        return None;
    }
    Some((section, index.parse().ok()?))
}

/// Formats a segment name.
#[must_use]
pub fn segment_name(section: &str, index: usize) -> String {
    format!("{section}_{index}")
}

fn build_section(name: &str, g: &SectionGeometry) -> ViewerResult<Section> {
    let arrays = [
        ("xcenter", &g.xcenter),
        ("ycenter", &g.ycenter),
        ("zcenter", &g.zcenter),
        ("xdirection", &g.xdirection),
        ("ydirection", &g.ydirection),
        ("zdirection", &g.zdirection),
        ("diam", &g.diam),
        ("length", &g.length),
        ("distance", &g.distance),
    ];
    let has_points = arrays.iter().any(|(_, a)| !a.is_empty());
    if has_points {
        if let Some((field, array)) = arrays.iter().find(|(_, a)| a.len() != g.nseg) {
            return Err(ViewerError::ProtocolViolation(format!(
                "section '{name}': {field} has {} entries, expected {}",
                array.len(),
                g.nseg
            )));
        }
    }

    let segments = (0..g.nseg)
        .map(|i| Segment {
            index: i,
            geometry: has_points.then(|| SegmentGeometry {
                center: vec3(g.xcenter[i], g.ycenter[i], g.zcenter[i]),
                direction: vec3(g.xdirection[i], g.ydirection[i], g.zdirection[i]),
                diameter: g.diam[i] as f32,
                length: g.length[i] as f32,
                distance: g.distance[i] as f32,
            }),
        })
        .collect();

    Ok(Section {
        name: name.to_string(),
        index: g.index,
        segments,
        children: Vec::new(),
        parent: None,
    })
}

fn vec3(x: f64, y: f64, z: f64) -> Vec3 {
    Vec3::new(x as f32, y as f32, z as f32)
}
