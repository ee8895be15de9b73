//! Camera and user controls.
//!
//! The anatomical view uses a perspective projection with free rotation. The dendrogram
//! view uses an orthographic projection with a fixed frustum height and rotation disabled
//! (pan and zoom only). Both cameras sit on the -Z axis looking at the origin.

use glam::{Mat4, Vec2, Vec3, Vec4Swizzles};

use crate::scene::Ray;

/// Projection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Perspective projection for the 3-D view.
    Perspective {
        fov_deg: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    /// Orthographic projection for the dendrogram view.
    Orthographic {
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    },
}

/// Pointer-driven camera controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Controls {
    /// User input is accepted.
    pub enabled: bool,
    /// Rotation is allowed (pan and zoom always are).
    pub rotate: bool,
    /// Point the camera orbits around.
    pub target: Vec3,
}

/// Camera settings shared by both views.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub fov_deg: f32,
    pub near: f32,
    pub far: f32,
    /// Distance from the origin along -Z.
    pub distance: f32,
    /// Visible height of the orthographic view.
    pub frustum_size: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fov_deg: 70.0,
            near: 1.0,
            far: 10_000.0,
            distance: 500.0,
            frustum_size: 670.0,
        }
    }
}

/// Viewer camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub projection: Projection,
    pub position: Vec3,
    pub up: Vec3,
    pub zoom: f32,
    pub controls: Controls,
    settings: CameraSettings,
    width: f32,
    height: f32,
}

impl Camera {
    /// Perspective camera for the 3-D view.
    #[must_use]
    pub fn perspective(settings: CameraSettings, width: f32, height: f32) -> Self {
        let mut camera = Self::home(settings, width, height, true);
        camera.apply_size();
        camera
    }

    /// Orthographic camera for the dendrogram view.
    #[must_use]
    pub fn orthographic(settings: CameraSettings, width: f32, height: f32) -> Self {
        let mut camera = Self::home(settings, width, height, false);
        camera.controls.rotate = false;
        camera.apply_size();
        camera
    }

    fn home(settings: CameraSettings, width: f32, height: f32, perspective: bool) -> Self {
        let projection = if perspective {
            Projection::Perspective {
                fov_deg: settings.fov_deg,
                aspect: 1.0,
                near: settings.near,
                far: settings.far,
            }
        } else {
            Projection::Orthographic {
                left: -1.0,
                right: 1.0,
                top: 1.0,
                bottom: -1.0,
                near: settings.near,
                far: settings.far,
            }
        };
        Self {
            projection,
            position: Self::home_position(&settings),
            up: Vec3::Y,
            zoom: 1.0,
            controls: Controls {
                enabled: true,
                rotate: true,
                target: Vec3::ZERO,
            },
            settings,
            width: width.max(1.0),
            height: height.max(1.0),
        }
    }

    /// Resting position of the camera.
    #[must_use]
    pub fn home_position(settings: &CameraSettings) -> Vec3 {
        Vec3::new(0.0, 0.0, -settings.distance)
    }

    /// Returns `true` for the orthographic (dendrogram) camera.
    #[must_use]
    pub fn is_orthographic(&self) -> bool {
        matches!(self.projection, Projection::Orthographic { .. })
    }

    /// Viewport size in pixels.
    #[must_use]
    pub fn size(&self) -> (f32, f32) {
        (self.width, self.height)
    }

    /// Adapts the projection to a new viewport size.
    pub fn resize(&mut self, width: f32, height: f32) {
        self.width = width.max(1.0);
        self.height = height.max(1.0);
        self.apply_size();
    }

    fn apply_size(&mut self) {
        let aspect = self.width / self.height;
        let frustum = self.settings.frustum_size;
        match &mut self.projection {
            Projection::Perspective { aspect: a, .. } => *a = aspect,
            Projection::Orthographic {
                left,
                right,
                top,
                bottom,
                ..
            } => {
                *left = -frustum * aspect / 2.0;
                *right = frustum * aspect / 2.0;
                *top = frustum / 2.0;
                *bottom = -frustum / 2.0;
            }
        }
    }

    /// World to camera transform.
    #[must_use]
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.controls.target, self.up)
    }

    /// Camera to clip transform.
    #[must_use]
    pub fn projection_matrix(&self) -> Mat4 {
        let zoom = self.zoom.max(f32::EPSILON);
        match self.projection {
            Projection::Perspective {
                fov_deg,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh_gl(fov_deg.to_radians(), aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                top,
                bottom,
                near,
                far,
            } => Mat4::orthographic_rh_gl(
                left / zoom,
                right / zoom,
                bottom / zoom,
                top / zoom,
                near,
                far,
            ),
        }
    }

    /// Ray through a point given in normalized device coordinates (`[-1, 1]²`, +Y up).
    #[must_use]
    pub fn ray_from_ndc(&self, ndc: Vec2) -> Ray {
        let inverse = (self.projection_matrix() * self.view_matrix()).inverse();
        let unproject = |z: f32| {
            let p = inverse * ndc.extend(z).extend(1.0);
            p.xyz() / p.w
        };
        let near = unproject(-1.0);
        let far = unproject(1.0);
        Ray::new(near, far - near)
    }

    /// Converts a pixel position (origin top-left) into normalized device coordinates.
    #[must_use]
    pub fn ndc_from_pixels(&self, x: f32, y: f32) -> Vec2 {
        Vec2::new(x / self.width * 2.0 - 1.0, -(y / self.height) * 2.0 + 1.0)
    }
}
