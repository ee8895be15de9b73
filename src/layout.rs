//! Layout targets for the two views.
//!
//! The anatomical view places every segment at its measured 3-D pose. The dendrogram view
//! stacks each section's segments vertically and places child sections side by side:
//!
//! ```text
//!   | child a | child b |      children start at base + parent height
//!   |    \    |   /     |
//!   |     -----         |
//!   |     |   |         |      parent segments stack upwards from `base`
//!   |     |   |         |
//!   l-----x----------------    x = left + total_width / 2
//! ```
//!
//! A section's `total_width` is its own footprint for a leaf and the sum of its children's
//! total widths otherwise. Computing the layout twice for the same tree gives the same
//! result.

use glam::{Quat, Vec3};
use rand::Rng;
use tracing::debug;

use crate::morphology::SegmentGeometry;
use crate::protocol::DendrogramNode;

/// Vertical gap between stacked segments.
pub const SEGMENT_PAD: f32 = 2.0;

/// Vertical position of the root section's first segment.
pub const DENDROGRAM_BASE: f32 = -300.0;

/// Position, orientation and scale of a primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Pose {
    /// Affine matrix of the pose.
    #[must_use]
    pub fn matrix(&self) -> glam::Mat4 {
        glam::Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// Tuning knobs of the dendrogram layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutOptions {
    /// Vertical base of the root section.
    pub base: f32,
    /// Gap between stacked segments.
    pub segment_pad: f32,
    /// Never let a parent be narrower than its own footprint.
    pub clamp_to_footprint: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            base: DENDROGRAM_BASE,
            segment_pad: SEGMENT_PAD,
            clamp_to_footprint: false,
        }
    }
}

/// Placement of one segment in the dendrogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPlacement {
    /// Segment index within its section.
    pub index: usize,
    /// Center of the upright cylinder.
    pub center: Vec3,
    /// Nominal segment length.
    pub length: f32,
    /// Segment diameter.
    pub diameter: f32,
}

/// Placement of one section in the dendrogram.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionPlacement {
    pub name: String,
    /// Left edge of the subtree.
    pub left: f32,
    /// Width of the subtree.
    pub total_width: f32,
    /// Vertical level of the first segment.
    pub base: f32,
    /// Horizontal center of the section's segments.
    pub center_x: f32,
    pub segments: Vec<SegmentPlacement>,
}

/// Computed dendrogram coordinates for a whole tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DendrogramLayout {
    /// Sections in depth-first order.
    pub sections: Vec<SectionPlacement>,
    /// Connector lines from each parent to each child.
    pub edges: Vec<(Vec3, Vec3)>,
    /// Width of the root subtree.
    pub total_width: f32,
}

impl DendrogramLayout {
    /// Looks up a section placement by name.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&SectionPlacement> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Width of the subtree rooted at `node`.
#[must_use]
pub fn subtree_width(node: &DendrogramNode, options: &LayoutOptions) -> f32 {
    measure(node, options).width
}

/// Subtree widths mirroring the node tree, measured once per layout.
struct Widths {
    width: f32,
    children: Vec<Widths>,
}

fn measure(node: &DendrogramNode, options: &LayoutOptions) -> Widths {
    let own = node.width as f32;
    if node.sections.is_empty() {
        return Widths {
            width: own,
            children: Vec::new(),
        };
    }
    let children: Vec<Widths> = node
        .sections
        .iter()
        .map(|child| measure(child, options))
        .collect();
    let sum: f32 = children.iter().map(|c| c.width).sum();
    let width = if options.clamp_to_footprint {
        sum.max(own)
    } else {
        sum
    };
    Widths { width, children }
}

/// Computes the dendrogram layout, centering the root horizontally on the origin.
#[must_use]
pub fn compute_dendrogram(root: &DendrogramNode, options: &LayoutOptions) -> DendrogramLayout {
    let widths = measure(root, options);
    let total_width = widths.width;
    if (total_width - root.total_width as f32).abs() > f32::EPSILON && root.total_width > 0.0 {
        debug!(
            computed = total_width,
            received = root.total_width,
            "Dendrogram width differs from backend value"
        );
    }

    let mut layout = DendrogramLayout {
        total_width,
        ..Default::default()
    };
    place(root, &widths, -total_width / 2.0, options.base, options, &mut layout);
    layout
}

fn place(
    node: &DendrogramNode,
    widths: &Widths,
    left: f32,
    base: f32,
    options: &LayoutOptions,
    layout: &mut DendrogramLayout,
) {
    let total_width = widths.width;
    let center_x = left + total_width / 2.0;
    let height = node.height as f32;

    let mut bottom = base;
    let segments = node
        .segments
        .iter()
        .enumerate()
        .map(|(index, seg)| {
            let length = seg.length as f32;
            let placement = SegmentPlacement {
                index,
                center: Vec3::new(center_x, bottom + length / 2.0, 0.0),
                length,
                diameter: seg.diam as f32,
            };
            bottom += options.segment_pad + length;
            placement
        })
        .collect();

    layout.sections.push(SectionPlacement {
        name: node.name.clone(),
        left,
        total_width,
        base,
        center_x,
        segments,
    });

    let mut offset = 0.0;
    for (child, child_widths) in node.sections.iter().zip(&widths.children) {
        let child_width = child_widths.width;
        let child_center = left + offset + child_width / 2.0;
        layout.edges.push((
            Vec3::new(center_x, base + height - options.segment_pad, 0.0),
            Vec3::new(child_center, base + height, 0.0),
        ));
        place(child, child_widths, left + offset, base + height, options, layout);
        offset += child_width;
    }
}

/// Anatomical pose of a segment cylinder of height `length`.
///
/// The cylinder's +Y axis is rotated onto the segment direction and stretched so that its
/// height matches the 3-D distance covered by the segment.
#[must_use]
pub fn anatomical_pose(geometry: &SegmentGeometry) -> Pose {
    let axis = geometry.direction.normalize_or_zero();
    let rotation = if axis == Vec3::ZERO {
        Quat::IDENTITY
    } else {
        Quat::from_rotation_arc(Vec3::Y, axis)
    };
    let stretch = if geometry.length > 0.0 {
        geometry.distance / geometry.length
    } else {
        1.0
    };
    Pose {
        translation: geometry.center,
        rotation,
        scale: Vec3::new(1.0, stretch, 1.0),
    }
}

/// Upright pose of a segment in the dendrogram.
#[must_use]
pub fn dendrogram_pose(placement: &SegmentPlacement) -> Pose {
    Pose {
        translation: placement.center,
        ..Default::default()
    }
}

/// Random pose of a synapse cone on the surface of its host segment, relative to the host.
///
/// The cone points away from the segment axis in a random direction and sits at a random
/// offset along the segment.
pub fn anatomical_synapse_pose<R: Rng + ?Sized>(
    rng: &mut R,
    diameter: f32,
    length: f32,
    cone_height: f32,
) -> Pose {
    let random = Vec3::new(spread(rng, 2.0), spread(rng, 2.0), spread(rng, 2.0));
    let axis = Vec3::Y.cross(random).normalize_or_zero();
    let rotation = if axis == Vec3::ZERO {
        Quat::IDENTITY
    } else {
        Quat::from_rotation_arc(Vec3::Y, axis)
    };
    let offset = spread(rng, length);
    let lift = rotation * Vec3::new(0.0, -diameter / 2.0 - cone_height / 3.0, 0.0);
    Pose {
        translation: Vec3::new(0.0, offset, 0.0) + lift,
        rotation,
        scale: Vec3::ONE,
    }
}

/// Random pose of a synapse cone in the dendrogram, relative to the host.
///
/// The cone lies in the drawing plane, on the left or right side of the segment.
pub fn dendrogram_synapse_pose<R: Rng + ?Sized>(rng: &mut R, diameter: f32, length: f32) -> Pose {
    let side = if rng.gen_bool(0.5) { -1.0 } else { 1.0 };
    Pose {
        translation: Vec3::new(side * diameter / 2.0, spread(rng, length / 2.0), 0.0),
        rotation: Quat::from_rotation_arc(Vec3::X, Vec3::new(0.0, side, 0.0)),
        scale: Vec3::ONE,
    }
}

/// Uniform sample in `[-range / 2, range / 2)`.
pub(crate) fn spread<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range <= 0.0 {
        return 0.0;
    }
    range * (rng.gen::<f32>() - 0.5)
}
