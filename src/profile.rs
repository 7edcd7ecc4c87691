//! Device profiles: a phone screen mounted in a particular viewer
//!
//! All distances are in meters, measured with the phone in landscape as it
//! sits in the viewer. Angles are in degrees. Profiles are plain values; the
//! render context owns the active one and rebuilds anything derived from it
//! when it is replaced.

use serde::{Deserialize, Serialize};

use crate::distortion::{DistortionModel, RadialDistortion};
use crate::error::{Result, StereoError};
use crate::viewport::{Rect, TanAngles};

/// Physical phone screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Screen {
    /// The long edge of the phone.
    pub width: f32,
    /// The short edge of the phone.
    pub height: f32,
    /// Distance from the bottom of the viewer to the bottom edge of the screen.
    pub border_bottom: f32,
}

/// Which viewer edge the lens offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LensAlignment {
    /// Offset measured down from the top of the viewer.
    Top,
    /// Lenses centered; the offset is ignored.
    Center,
    /// Offset measured up from the bottom of the viewer.
    Bottom,
}

impl LensAlignment {
    /// Sign relating the offset's coordinates to device coordinates.
    pub fn signum(self) -> f32 {
        match self {
            LensAlignment::Top => -1.0,
            LensAlignment::Center => 0.0,
            LensAlignment::Bottom => 1.0,
        }
    }

    fn from_signum(value: f32) -> Self {
        if value < -0.5 {
            LensAlignment::Top
        } else if value > 0.5 {
            LensAlignment::Bottom
        } else {
            LensAlignment::Center
        }
    }
}

/// Lens placement inside the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Lenses {
    /// Center to center.
    pub separation: f32,
    /// Offset of the lens centers from the aligned edge.
    pub offset: f32,
    /// Distance from the lens centers to the phone screen.
    pub screen_distance: f32,
    pub alignment: LensAlignment,
}

/// Maximum visible half-angles through one lens, all positive.
///
/// Left and right eyes are mirror images, so both share inner and outer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaxFov {
    /// Towards the side of the screen.
    pub outer: f32,
    /// Towards the center line of the screen.
    pub inner: f32,
    /// Towards the top of the screen.
    pub upper: f32,
    /// Towards the bottom of the screen.
    pub lower: f32,
}

impl MaxFov {
    pub const fn uniform(degrees: f32) -> Self {
        Self { outer: degrees, inner: degrees, upper: degrees, lower: degrees }
    }
}

/// Lens and optics description of a viewer, independent of the phone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Viewer {
    pub lenses: Lenses,
    pub max_fov: MaxFov,
    /// Forward distortion coefficients.
    pub distortion: RadialDistortion,
    /// Fitted approximate inverse of `distortion`.
    pub inverse: RadialDistortion,
}

impl Viewer {
    /// Viewer whose inverse is fitted from the forward coefficients.
    pub fn with_fitted_inverse(lenses: Lenses, max_fov: MaxFov, distortion: RadialDistortion) -> Self {
        Self {
            lenses,
            max_fov,
            distortion,
            inverse: distortion.approximate_inverse(1.0, 100),
        }
    }
}

/// Some known phone screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenModel {
    #[default]
    Nexus5,
    Nexus6,
    GalaxyS6,
    GalaxyNote4,
    #[serde(rename = "lg-g3")]
    LgG3,
    #[serde(rename = "iphone4")]
    IPhone4,
    #[serde(rename = "iphone5")]
    IPhone5,
    #[serde(rename = "iphone6")]
    IPhone6,
    #[serde(rename = "iphone6p")]
    IPhone6p,
}

impl ScreenModel {
    pub fn screen(self) -> Screen {
        let (width, height, border_bottom) = match self {
            ScreenModel::Nexus5 => (0.110, 0.062, 0.004),
            ScreenModel::Nexus6 => (0.133, 0.074, 0.004),
            ScreenModel::GalaxyS6 => (0.114, 0.0635, 0.0035),
            ScreenModel::GalaxyNote4 => (0.125, 0.0705, 0.0045),
            ScreenModel::LgG3 => (0.121, 0.068, 0.003),
            ScreenModel::IPhone4 => (0.075, 0.050, 0.0045),
            ScreenModel::IPhone5 => (0.089, 0.050, 0.0045),
            ScreenModel::IPhone6 => (0.104, 0.058, 0.005),
            ScreenModel::IPhone6p => (0.112, 0.068, 0.005),
        };
        Screen { width, height, border_bottom }
    }
}

/// Some known viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewerModel {
    /// Cardboard v1.
    #[default]
    #[serde(rename = "cardboard-jun2014")]
    CardboardJun2014,
    /// Cardboard v2.
    #[serde(rename = "cardboard-may2015")]
    CardboardMay2015,
    /// Go4D C1-Glass.
    #[serde(rename = "goggletech-c1-glass")]
    GoggleTechC1Glass,
}

impl ViewerModel {
    pub fn viewer(self) -> Viewer {
        match self {
            ViewerModel::CardboardJun2014 => Viewer {
                lenses: Lenses {
                    separation: 0.060,
                    offset: 0.035,
                    screen_distance: 0.042,
                    alignment: LensAlignment::Bottom,
                },
                max_fov: MaxFov::uniform(40.0),
                distortion: RadialDistortion::new(0.441, 0.156),
                inverse: RadialDistortion::new(-0.423, 0.239),
            },
            ViewerModel::CardboardMay2015 => Viewer::with_fitted_inverse(
                Lenses {
                    separation: 0.064,
                    offset: 0.035,
                    screen_distance: 0.039,
                    alignment: LensAlignment::Bottom,
                },
                MaxFov::uniform(60.0),
                RadialDistortion::new(0.34, 0.55),
            ),
            ViewerModel::GoggleTechC1Glass => Viewer::with_fitted_inverse(
                Lenses {
                    separation: 0.065,
                    offset: 0.036,
                    screen_distance: 0.058,
                    alignment: LensAlignment::Bottom,
                },
                MaxFov::uniform(50.0),
                RadialDistortion::new(0.3, 0.0),
            ),
        }
    }
}

/// Number of floats in a native profile parameter block.
pub const NATIVE_PARAM_COUNT: usize = 13;

/// Measurements of a particular phone in a particular viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceProfile {
    pub screen: Screen,
    pub viewer: Viewer,
}

impl Default for DeviceProfile {
    /// Nexus 5 in a Cardboard v1.
    fn default() -> Self {
        Self::known(ScreenModel::Nexus5, ViewerModel::CardboardJun2014)
    }
}

impl DeviceProfile {
    pub fn new(screen: Screen, viewer: Viewer) -> Self {
        Self { screen, viewer }
    }

    pub fn known(screen: ScreenModel, viewer: ViewerModel) -> Self {
        Self { screen: screen.screen(), viewer: viewer.viewer() }
    }

    /// Decodes the parameter block a native viewer service reports:
    /// `[fov outer, upper, inner, lower, screen width, height, border,
    /// lens separation, offset, screen distance, alignment, k1, k2]`.
    ///
    /// The inverse distortion is fitted from `k1, k2`.
    pub fn from_native_params(data: &[f32]) -> Result<Self> {
        if data.len() != NATIVE_PARAM_COUNT {
            return Err(StereoError::InvalidProfileData {
                expected: NATIVE_PARAM_COUNT,
                actual: data.len(),
            });
        }
        let max_fov = MaxFov {
            outer: data[0],
            upper: data[1],
            inner: data[2],
            lower: data[3],
        };
        let screen = Screen {
            width: data[4],
            height: data[5],
            border_bottom: data[6],
        };
        let lenses = Lenses {
            separation: data[7],
            offset: data[8],
            screen_distance: data[9],
            alignment: LensAlignment::from_signum(data[10]),
        };
        let distortion = RadialDistortion::new(data[11], data[12]);
        Ok(Self {
            screen,
            viewer: Viewer::with_fitted_inverse(lenses, max_fov, distortion),
        })
    }

    pub fn distortion_model(&self) -> DistortionModel {
        DistortionModel::new(self.viewer.distortion, self.viewer.inverse)
    }

    /// Physical screen aspect ratio (width over height).
    pub fn screen_aspect(&self) -> f32 {
        self.screen.width / self.screen.height
    }

    /// Vertical offset of the lens centers from the screen center.
    pub fn vertical_lens_offset(&self) -> f32 {
        let lenses = &self.viewer.lenses;
        (lenses.offset - self.screen.border_bottom - self.screen.height / 2.0)
            * lenses.alignment.signum()
    }

    /// Screen edges of the left half as tan-angles from the left lens axis.
    fn left_eye_screen_tan_angles(&self) -> TanAngles {
        let lenses = &self.viewer.lenses;
        let half_width = self.screen.width / 4.0;
        let half_height = self.screen.height / 2.0;
        // Viewport center, measured from the left lens position.
        let center_x = lenses.separation / 2.0 - half_width;
        let center_y = -self.vertical_lens_offset();
        let center_z = lenses.screen_distance;
        TanAngles {
            left: (center_x - half_width) / center_z,
            top: (center_y + half_height) / center_z,
            right: (center_x + half_width) / center_z,
            bottom: (center_y - half_height) / center_z,
        }
    }

    fn max_fov_tan_angles(&self) -> TanAngles {
        let fov = &self.viewer.max_fov;
        TanAngles::from_degrees(fov.outer, fov.upper, fov.inner, fov.lower)
    }

    /// Left eye frustum as seen through the lens: the lens FOV clipped by
    /// the distorted screen edges.
    pub fn left_eye_visible_tan_angles(&self) -> TanAngles {
        let distortion = &self.viewer.distortion;
        let screen = self.left_eye_screen_tan_angles();
        let screen = TanAngles {
            left: distortion.distort(screen.left),
            top: distortion.distort(screen.top),
            right: distortion.distort(screen.right),
            bottom: distortion.distort(screen.bottom),
        };
        self.max_fov_tan_angles().intersect(&screen)
    }

    /// Left eye frustum with the lens removed: the undistorted lens FOV
    /// clipped by the raw screen edges.
    pub fn left_eye_no_lens_tan_angles(&self) -> TanAngles {
        let inverse = &self.viewer.inverse;
        let fov = self.max_fov_tan_angles();
        let fov = TanAngles {
            left: inverse.distort(fov.left),
            top: inverse.distort(fov.top),
            right: inverse.distort(fov.right),
            bottom: inverse.distort(fov.bottom),
        };
        fov.intersect(&self.left_eye_screen_tan_angles())
    }

    /// Rectangle of the physical screen the left eye can see, normalized to
    /// the whole screen, from an undistorted (no lens) frustum.
    pub fn left_eye_visible_screen_rect(&self, undistorted: &TanAngles) -> Rect {
        let dist = self.viewer.lenses.screen_distance;
        let eye_x = (self.screen.width - self.viewer.lenses.separation) / 2.0;
        let eye_y = self.vertical_lens_offset() + self.screen.height / 2.0;
        let left = (undistorted.left * dist + eye_x) / self.screen.width;
        let top = (undistorted.top * dist + eye_y) / self.screen.height;
        let right = (undistorted.right * dist + eye_x) / self.screen.width;
        let bottom = (undistorted.bottom * dist + eye_y) / self.screen.height;
        Rect::new(left, bottom, right - left, top - bottom)
    }
}
