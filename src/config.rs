//! YAML configuration for the stereo rig
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```yaml
//! stereo-multiplier: 0.8
//! comfortable-viewing-range: [0.5, 1000]
//! distortion-correction: mesh
//! screen: nexus6
//! viewer: cardboard-may2015
//! ```

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::compositor::CorrectionStrategy;
use crate::context::STEREO_SCREEN_SCALE_RANGE;
use crate::error::{Result, StereoError};
use crate::mesh::MeshMode;
use crate::profile::{DeviceProfile, ScreenModel, ViewerModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StereoConfig {
    /// Start in stereo. Can be toggled at runtime.
    pub vr_mode: bool,
    /// Scales eye separation; 0 turns stereo separation off.
    pub stereo_multiplier: f32,
    /// How much the eyes move to match the mono camera's view of the
    /// center of interest.
    pub match_mono_fov: f32,
    /// Share of FOV matching done by zooming instead of moving the eyes.
    pub match_by_zoom: f32,
    /// Apparent depth of picture-in-picture cameras.
    pub screen_parallax: f32,
    pub stereo_padding_x: f32,
    pub stereo_padding_y: f32,
    pub check_stereo_comfort: bool,
    /// Distances in meters at which stereo is shown at full strength.
    pub comfortable_viewing_range: [f32; 2],
    /// Render eyes straight into the stereo screen instead of through a
    /// temporary target.
    pub direct_render: bool,
    /// Recompute eye placement every frame instead of on profile changes.
    pub keep_stereo_updated: bool,
    /// Seconds.
    pub stereo_adjust_smoothing: f32,
    pub track_rotation: bool,
    pub track_position: bool,
    /// Preferred method; degraded at startup if the platform lacks support.
    pub distortion_correction: CorrectionStrategy,
    pub mesh_width: usize,
    pub mesh_height: usize,
    pub mesh_mode: MeshMode,
    pub stereo_screen_scale: f32,
    pub screen: ScreenModel,
    pub viewer: ViewerModel,
    /// Overrides `screen` and `viewer` when present.
    pub custom_profile: Option<DeviceProfile>,
    /// Only used by the simulated head tracker.
    pub neck_model_scale: f32,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            vr_mode: true,
            stereo_multiplier: 1.0,
            match_mono_fov: 0.0,
            match_by_zoom: 0.0,
            screen_parallax: 0.0,
            stereo_padding_x: 0.0,
            stereo_padding_y: 0.0,
            check_stereo_comfort: true,
            comfortable_viewing_range: [0.4, 100_000.0],
            direct_render: true,
            keep_stereo_updated: false,
            stereo_adjust_smoothing: 0.1,
            track_rotation: true,
            track_position: false,
            distortion_correction: CorrectionStrategy::MeshBased,
            mesh_width: 40,
            mesh_height: 40,
            mesh_mode: MeshMode::DistortVertices,
            stereo_screen_scale: 1.0,
            screen: ScreenModel::default(),
            viewer: ViewerModel::default(),
            custom_profile: None,
            neck_model_scale: 0.0,
        }
    }
}

impl StereoConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        Ok(config.validated()?.sanitized())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }

    /// Rejects values no clamping can repair.
    pub fn validated(self) -> Result<Self> {
        let floats = [
            ("stereo-multiplier", self.stereo_multiplier),
            ("match-mono-fov", self.match_mono_fov),
            ("match-by-zoom", self.match_by_zoom),
            ("screen-parallax", self.screen_parallax),
            ("stereo-padding-x", self.stereo_padding_x),
            ("stereo-padding-y", self.stereo_padding_y),
            ("comfortable-viewing-range", self.comfortable_viewing_range[0]),
            ("comfortable-viewing-range", self.comfortable_viewing_range[1]),
            ("stereo-adjust-smoothing", self.stereo_adjust_smoothing),
            ("stereo-screen-scale", self.stereo_screen_scale),
            ("neck-model-scale", self.neck_model_scale),
        ];
        if let Some((key, _)) = floats.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StereoError::InvalidConfig(format!("{key} must be a finite number")));
        }
        Ok(self)
    }

    /// Clamps every knob into its usable range.
    pub fn sanitized(mut self) -> Self {
        self.stereo_multiplier = self.stereo_multiplier.clamp(0.0, 1.0);
        self.match_mono_fov = self.match_mono_fov.clamp(0.0, 1.0);
        self.match_by_zoom = self.match_by_zoom.clamp(0.0, 1.0);
        self.screen_parallax = self.screen_parallax.clamp(0.0, 1.0);
        self.stereo_padding_x = self.stereo_padding_x.clamp(0.0, 1.0);
        self.stereo_padding_y = self.stereo_padding_y.clamp(0.0, 1.0);
        self.stereo_adjust_smoothing = self.stereo_adjust_smoothing.max(0.0);
        self.neck_model_scale = self.neck_model_scale.max(0.0);
        let (lo, hi) = STEREO_SCREEN_SCALE_RANGE;
        self.stereo_screen_scale = self.stereo_screen_scale.clamp(lo, hi);
        self.mesh_width = self.mesh_width.max(2);
        self.mesh_height = self.mesh_height.max(2);

        let [min, max] = self.comfortable_viewing_range;
        if min > max {
            warn!(
                "comfortable-viewing-range [{}, {}] is inverted; swapping",
                min, max
            );
            self.comfortable_viewing_range = [max, min];
        }
        self
    }

    /// The profile to start with.
    pub fn device_profile(&self) -> DeviceProfile {
        self.custom_profile
            .unwrap_or_else(|| DeviceProfile::known(self.screen, self.viewer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::LensAlignment;

    #[test]
    fn empty_document_gives_defaults() {
        let config = StereoConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, StereoConfig::default());
        assert_eq!(config.device_profile(), DeviceProfile::default());
    }

    #[test]
    fn kebab_case_keys() {
        let config = StereoConfig::from_yaml_str(
            "stereo-multiplier: 0.5\n\
             distortion-correction: shader\n\
             mesh-mode: distort-texture\n\
             screen: iphone6\n\
             viewer: goggletech-c1-glass\n",
        )
        .unwrap();
        assert_eq!(config.stereo_multiplier, 0.5);
        assert_eq!(config.distortion_correction, CorrectionStrategy::ShaderBased);
        assert_eq!(config.mesh_mode, MeshMode::DistortTexture);
        assert_eq!(config.device_profile().screen.width, 0.104);
        assert_eq!(config.device_profile().viewer.lenses.separation, 0.065);
    }

    #[test]
    fn values_are_clamped() {
        let config = StereoConfig::from_yaml_str(
            "stereo-multiplier: 3\n\
             match-mono-fov: -1\n\
             stereo-screen-scale: 0\n\
             mesh-width: 1\n\
             comfortable-viewing-range: [10, 2]\n",
        )
        .unwrap();
        assert_eq!(config.stereo_multiplier, 1.0);
        assert_eq!(config.match_mono_fov, 0.0);
        assert_eq!(config.stereo_screen_scale, 0.1);
        assert_eq!(config.mesh_width, 2);
        assert_eq!(config.comfortable_viewing_range, [2.0, 10.0]);
    }

    #[test]
    fn custom_profile_overrides_models() {
        let config = StereoConfig::from_yaml_str(
            r#"
custom-profile:
  screen: { width: 0.12, height: 0.07, border-bottom: 0.003 }
  viewer:
    lenses: { separation: 0.062, offset: 0.034, screen-distance: 0.04, alignment: center }
    max-fov: { outer: 45, inner: 45, upper: 45, lower: 45 }
    distortion: [0.2, 0.1]
    inverse: [-0.19, 0.08]
"#,
        )
        .unwrap();
        let profile = config.device_profile();
        assert_eq!(profile.screen.width, 0.12);
        assert_eq!(profile.viewer.lenses.alignment, LensAlignment::Center);
        assert_eq!(profile.viewer.inverse.k2(), 0.08);
    }

    #[test]
    fn unknown_enum_value_is_an_error() {
        let err = StereoConfig::from_yaml_str("distortion-correction: magic").unwrap_err();
        assert!(matches!(err, StereoError::Config(_)));
    }

    #[test]
    fn non_finite_is_rejected() {
        let err = StereoConfig::from_yaml_str("stereo-multiplier: .nan").unwrap_err();
        assert!(matches!(err, StereoError::InvalidConfig(_)));
    }
}
