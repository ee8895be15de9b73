//! Interpolation scheduler for view transitions.
//!
//! A tween moves one attribute of one target from a start value to an end value over a
//! fixed duration. Tweens are collected in groups; [`TweenScheduler::tick`] advances all of
//! them to the given time and reports which groups finished, so the caller can apply
//! follow-up changes (such as swapping the camera) only once every animation of a
//! transition is done.

use glam::{Quat, Vec3};

/// What a tween animates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TweenTarget {
    /// Segment primitive by index.
    Segment(usize),
    /// Synapse cone by host primitive and position.
    Synapse { segment: usize, synapse: usize },
    /// The camera.
    Camera,
}

/// Which attribute of the target is animated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TweenAttribute {
    Position,
    Rotation,
    Scale,
    /// Camera orbit target.
    LookAt,
    /// Camera up vector.
    Up,
    /// Camera zoom.
    Zoom,
}

/// Animated value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TweenValue {
    Vector(Vec3),
    /// Interpolated along the shortest arc.
    Orientation(Quat),
    Scalar(f32),
}

impl TweenValue {
    /// Interpolates towards `to` at eased progress `t`. Mismatched kinds jump to `to`.
    #[must_use]
    pub fn interpolate(self, to: TweenValue, t: f32) -> TweenValue {
        match (self, to) {
            (TweenValue::Vector(a), TweenValue::Vector(b)) => TweenValue::Vector(a.lerp(b, t)),
            (TweenValue::Orientation(a), TweenValue::Orientation(b)) => {
                TweenValue::Orientation(a.slerp(b, t))
            }
            (TweenValue::Scalar(a), TweenValue::Scalar(b)) => TweenValue::Scalar(a + (b - a) * t),
            (_, to) => to,
        }
    }
}

/// Identifier of a tween group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

/// One running animation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tween {
    pub group: GroupId,
    pub target: TweenTarget,
    pub attribute: TweenAttribute,
    pub from: TweenValue,
    pub to: TweenValue,
    pub start_ms: f64,
    pub duration_ms: f64,
}

impl Tween {
    /// Linear progress at `now_ms`, clamped to `[0, 1]`.
    #[must_use]
    pub fn progress(&self, now_ms: f64) -> f32 {
        if self.duration_ms <= 0.0 {
            return 1.0;
        }
        ((now_ms - self.start_ms) / self.duration_ms).clamp(0.0, 1.0) as f32
    }
}

/// New value of an attribute produced by a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TweenUpdate {
    pub target: TweenTarget,
    pub attribute: TweenAttribute,
    pub value: TweenValue,
}

/// Result of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickResult {
    pub updates: Vec<TweenUpdate>,
    /// Groups whose last tween finished during this tick.
    pub completed: Vec<GroupId>,
}

/// Quadratic ease-in-out.
#[must_use]
pub fn ease_in_out(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        2.0 * t * t
    } else {
        -1.0 + (4.0 - 2.0 * t) * t
    }
}

/// Collection of running tweens.
#[derive(Debug, Default)]
pub struct TweenScheduler {
    tweens: Vec<Tween>,
    next_group: u64,
}

impl TweenScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new group.
    pub fn begin_group(&mut self) -> GroupId {
        self.next_group += 1;
        GroupId(self.next_group)
    }

    /// Adds a tween to a group.
    pub fn add(&mut self, tween: Tween) {
        self.tweens.push(tween);
    }

    /// Returns `true` while any tween is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.tweens.is_empty()
    }

    /// Returns `true` while any tween of `group` is running.
    #[must_use]
    pub fn is_group_active(&self, group: GroupId) -> bool {
        self.tweens.iter().any(|t| t.group == group)
    }

    /// Number of running tweens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tweens.len()
    }

    /// Returns `true` if nothing is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tweens.is_empty()
    }

    /// Drops every running tween without completing its group.
    pub fn cancel_all(&mut self) {
        self.tweens.clear();
    }

    /// Advances every tween to `now_ms`.
    ///
    /// Finished tweens report their exact end value and are removed. A group is reported
    /// as completed in the tick that removes its last tween.
    pub fn tick(&mut self, now_ms: f64) -> TickResult {
        let mut result = TickResult::default();
        if self.tweens.is_empty() {
            return result;
        }

        let mut finished_groups = Vec::new();
        self.tweens.retain(|tween| {
            let progress = tween.progress(now_ms);
            let value = if progress >= 1.0 {
                tween.to
            } else {
                tween.from.interpolate(tween.to, ease_in_out(progress))
            };
            result.updates.push(TweenUpdate {
                target: tween.target,
                attribute: tween.attribute,
                value,
            });
            if progress >= 1.0 {
                finished_groups.push(tween.group);
                false
            } else {
                true
            }
        });

        finished_groups.sort_unstable();
        finished_groups.dedup();
        result.completed = finished_groups
            .into_iter()
            .filter(|group| !self.is_group_active(*group))
            .collect();
        result
    }
}
