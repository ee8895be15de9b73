//! Renderable scene built from the morphology.
//!
//! The scene holds one cylinder primitive per segment with 3-D geometry, synapse cones as
//! children of their host segment, a hover outline and the dendrogram connector lines.
//! Rendering back ends read it; nothing in here draws.
//!
//! Scene operations never fail: unknown names and missing data are silently ignored (and
//! logged at `debug`).

use std::collections::HashMap;

use glam::{Mat4, Vec3};
use rand::Rng;
use tracing::debug;

use crate::layout::{self, Pose};
use crate::morphology::{segment_name, MorphologyModel};
use crate::protocol::SynapsesPayload;

/// Linear RGB color with components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    /// Color from a `0xRRGGBB` value.
    #[must_use]
    pub fn from_hex(hex: u32) -> Self {
        Self {
            r: ((hex >> 16) & 0xff) as f32 / 255.0,
            g: ((hex >> 8) & 0xff) as f32 / 255.0,
            b: (hex & 0xff) as f32 / 255.0,
        }
    }

    /// Color as a `0xRRGGBB` value.
    #[must_use]
    pub fn to_hex(self) -> u32 {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
        (channel(self.r) << 16) | (channel(self.g) << 8) | channel(self.b)
    }

    /// Linear interpolation towards `other`; `t` is clamped to `[0, 1]`.
    #[must_use]
    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        Rgb {
            r: self.r + (other.r - self.r) * t,
            g: self.g + (other.g - self.g) * t,
            b: self.b + (other.b - self.b) * t,
        }
    }
}

/// Section and synapse colors as `0xRRGGBB`.
pub mod palette {
    use super::Rgb;

    pub const SOMA: u32 = 0x646464;
    pub const AXON: u32 = 0x4169ff;
    pub const DEND: u32 = 0xdc143c;
    pub const APIC: u32 = 0x960096;
    pub const SPINE: u32 = 0xff9900;
    /// Color of a fully depolarized segment.
    pub const SPIKE: u32 = 0xffdf00;
    pub const EXCITATORY: u32 = 0xff0000;
    pub const INHIBITORY: u32 = 0x6699ff;
    pub const FALLBACK: u32 = 0x888888;
    /// Hover outline.
    pub const OUTLINE: u32 = SPIKE;

    const PREFIXES: [(&str, u32); 7] = [
        ("soma", SOMA),
        ("axon", AXON),
        ("dend", DEND),
        ("apic", APIC),
        ("spine", SPINE),
        ("exc", EXCITATORY),
        ("inh", INHIBITORY),
    ];

    /// Color for a section name or synapse type, chosen by prefix.
    #[must_use]
    pub fn color_for(name: &str) -> Rgb {
        let hex = PREFIXES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map_or(FALLBACK, |(_, hex)| *hex);
        Rgb::from_hex(hex)
    }

    /// Spike color.
    #[must_use]
    pub fn spike() -> Rgb {
        Rgb::from_hex(SPIKE)
    }
}

/// Synapse cone attached to a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SynapsePrimitive {
    /// Synapse type tag from the payload.
    pub kind: String,
    pub radius: f32,
    pub height: f32,
    pub color: Rgb,
    /// Pose relative to the host segment.
    pub pose: Pose,
}

/// Cylinder drawn for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPrimitive {
    /// `section_index` name.
    pub name: String,
    pub section: String,
    pub segment: usize,
    pub radius: f32,
    /// Cylinder height before scaling (nominal segment length).
    pub length: f32,
    /// 3-D extent of the segment.
    pub distance: f32,
    /// Spines are drawn closed, everything else open ended.
    pub capped: bool,
    pub pose: Pose,
    pub resting_color: Rgb,
    pub color: Rgb,
    pub synapses: Vec<SynapsePrimitive>,
}

impl SegmentPrimitive {
    /// World transform of the primitive.
    #[must_use]
    pub fn matrix(&self) -> Mat4 {
        self.pose.matrix()
    }
}

/// Box drawn around the hovered segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outline {
    pub visible: bool,
    /// Box extents (diameter, length, diameter).
    pub size: Vec3,
    pub pose: Pose,
    pub color: Rgb,
}

impl Default for Outline {
    fn default() -> Self {
        Self {
            visible: false,
            size: Vec3::ZERO,
            pose: Pose::default(),
            color: Rgb::from_hex(palette::OUTLINE),
        }
    }
}

/// A half line used for picking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit direction.
    pub direction: Vec3,
}

impl Ray {
    /// Creates a ray; the direction is normalized.
    #[must_use]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }
}

/// Nearest primitive hit by a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Index into [`Scene::primitives`].
    pub primitive: usize,
    /// Distance along the ray.
    pub distance: f32,
}

/// All renderable state.
#[derive(Debug, Default)]
pub struct Scene {
    generation: u64,
    primitives: Vec<SegmentPrimitive>,
    by_name: HashMap<String, usize>,
    slots: Vec<Option<usize>>,
    outline: Outline,
    edges: Vec<(Vec3, Vec3)>,
}

impl Scene {
    /// Creates an empty scene.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Morphology generation the scene was built from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Segment primitives in canonical order.
    #[must_use]
    pub fn primitives(&self) -> &[SegmentPrimitive] {
        &self.primitives
    }

    /// Mutable access to one primitive.
    pub fn primitive_mut(&mut self, index: usize) -> Option<&mut SegmentPrimitive> {
        self.primitives.get_mut(index)
    }

    /// Looks up a primitive by segment name.
    #[must_use]
    pub fn primitive_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Looks up a primitive by segment name.
    #[must_use]
    pub fn primitive(&self, name: &str) -> Option<&SegmentPrimitive> {
        self.primitive_index(name).map(|i| &self.primitives[i])
    }

    /// Hover outline.
    #[must_use]
    pub fn outline(&self) -> &Outline {
        &self.outline
    }

    /// Dendrogram connector lines; empty outside the dendrogram view.
    #[must_use]
    pub fn edges(&self) -> &[(Vec3, Vec3)] {
        &self.edges
    }

    /// Number of synapse cones.
    #[must_use]
    pub fn synapse_count(&self) -> usize {
        self.primitives.iter().map(|p| p.synapses.len()).sum()
    }

    /// Drops every primitive, edge and the outline.
    pub fn clear(&mut self) {
        self.primitives.clear();
        self.by_name.clear();
        self.slots.clear();
        self.edges.clear();
        self.outline.visible = false;
    }

    /// Discards all primitives and builds new ones at their anatomical pose.
    pub fn rebuild(&mut self, model: &MorphologyModel) {
        self.clear();
        self.generation = model.generation();

        for at in model.canonical_order() {
            let slot = model.segment(*at).and_then(|(section, segment)| {
                let geometry = segment.geometry?;
                let name = segment_name(&section.name, segment.index);
                let resting_color = palette::color_for(&section.name);
                let index = self.primitives.len();
                self.primitives.push(SegmentPrimitive {
                    name: name.clone(),
                    section: section.name.clone(),
                    segment: segment.index,
                    radius: geometry.diameter / 2.0,
                    length: geometry.length,
                    distance: geometry.distance,
                    capped: section.name.starts_with("spine"),
                    pose: layout::anatomical_pose(&geometry),
                    resting_color,
                    color: resting_color,
                    synapses: Vec::new(),
                });
                self.by_name.insert(name, index);
                Some(index)
            });
            self.slots.push(slot);
        }
        debug!(
            generation = self.generation,
            primitives = self.primitives.len(),
            "Rebuilt scene"
        );
    }

    /// Replaces all synapse cones, placing each at a fresh random spot on its host.
    ///
    /// Returns the number of cones attached; sites on unknown segments are skipped.
    pub fn attach_synapses<R: Rng + ?Sized>(&mut self, synapses: &SynapsesPayload, rng: &mut R) -> usize {
        for primitive in &mut self.primitives {
            primitive.synapses.clear();
        }

        let mut attached = 0;
        for (kind, sites) in synapses {
            let color = palette::color_for(kind);
            for site in sites {
                let name = segment_name(&site.sec_name, site.seg_idx);
                let Some(&index) = self.by_name.get(&name) else {
                    debug!(segment = %name, synapse = %kind, "Skipping synapse on unknown segment");
                    continue;
                };
                let host = &mut self.primitives[index];
                let height = rng.gen_range(0.5..1.2);
                let radius = rng.gen_range(0.25..=height / 2.0);
                let pose = layout::anatomical_synapse_pose(rng, host.radius * 2.0, host.length, height);
                host.synapses.push(SynapsePrimitive {
                    kind: kind.clone(),
                    radius,
                    height,
                    color,
                    pose,
                });
                attached += 1;
            }
        }
        debug!(attached, "Attached synapses");
        attached
    }

    /// Number of canonical slots (equal to the model's canonical length).
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Sets the color of the primitive at a canonical slot, if it has one.
    pub fn set_slot_color(&mut self, slot: usize, color: Rgb) {
        if let Some(Some(index)) = self.slots.get(slot) {
            self.primitives[*index].color = color;
        }
    }

    /// Resting color of the primitive at a canonical slot.
    #[must_use]
    pub fn slot_resting_color(&self, slot: usize) -> Option<Rgb> {
        let index = (*self.slots.get(slot)?)?;
        Some(self.primitives[index].resting_color)
    }

    /// Current color of the primitive at a canonical slot.
    #[must_use]
    pub fn slot_color(&self, slot: usize) -> Option<Rgb> {
        let index = (*self.slots.get(slot)?)?;
        Some(self.primitives[index].color)
    }

    /// Reverts every primitive to its resting color.
    pub fn reset_colors(&mut self) {
        for primitive in &mut self.primitives {
            primitive.color = primitive.resting_color;
        }
    }

    /// Replaces the dendrogram connector lines.
    pub fn set_edges(&mut self, edges: Vec<(Vec3, Vec3)>) {
        self.edges = edges;
    }

    /// Places the outline around a primitive.
    ///
    /// `use_nominal_length` selects the nominal segment length (dendrogram view) instead
    /// of the 3-D distance.
    pub fn show_outline(&mut self, index: usize, use_nominal_length: bool) {
        let Some(primitive) = self.primitives.get(index) else {
            self.hide_outline();
            return;
        };
        let diameter = primitive.radius * 2.0;
        let length = if use_nominal_length {
            primitive.length
        } else {
            primitive.distance
        };
        self.outline = Outline {
            visible: true,
            size: Vec3::new(diameter, length, diameter),
            pose: Pose {
                translation: primitive.pose.translation,
                rotation: primitive.pose.rotation,
                scale: Vec3::ONE,
            },
            color: Rgb::from_hex(palette::OUTLINE),
        };
    }

    /// Hides the outline.
    pub fn hide_outline(&mut self) {
        self.outline.visible = false;
    }

    /// Finds the nearest primitive hit by `ray`.
    #[must_use]
    pub fn pick(&self, ray: &Ray) -> Option<Hit> {
        self.primitives
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                intersect_cylinder(ray, p).map(|distance| Hit {
                    primitive: i,
                    distance,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }
}

/// Distance along `ray` to the surface of a primitive's cylinder.
fn intersect_cylinder(ray: &Ray, primitive: &SegmentPrimitive) -> Option<f32> {
    let inverse = primitive.matrix().inverse();
    if !inverse.is_finite() {
        return None;
    }
    // Local space keeps the ray parameter, so t is a world distance.
    let origin = inverse.transform_point3(ray.origin);
    let direction = inverse.transform_vector3(ray.direction);
    let radius = primitive.radius;
    let half = primitive.length / 2.0;

    let mut best: Option<f32> = None;
    let mut consider = |t: f32| {
        if t >= 0.0 && best.map_or(true, |b| t < b) {
            best = Some(t);
        }
    };

    // Side: x² + z² = r², |y| <= half.
    let a = direction.x * direction.x + direction.z * direction.z;
    let b = 2.0 * (origin.x * direction.x + origin.z * direction.z);
    let c = origin.x * origin.x + origin.z * origin.z - radius * radius;
    if a > f32::EPSILON {
        let discriminant = b * b - 4.0 * a * c;
        if discriminant >= 0.0 {
            let root = discriminant.sqrt();
            for t in [(-b - root) / (2.0 * a), (-b + root) / (2.0 * a)] {
                if (origin.y + t * direction.y).abs() <= half {
                    consider(t);
                }
            }
        }
    }

    if primitive.capped && direction.y.abs() > f32::EPSILON {
        for cap in [-half, half] {
            let t = (cap - origin.y) / direction.y;
            let x = origin.x + t * direction.x;
            let z = origin.z + t * direction.z;
            if x * x + z * z <= radius * radius {
                consider(t);
            }
        }
    }

    best
}
