//! Cardboard Stereo - stereo rendering and lens distortion correction for
//! phone-in-headset VR viewers.
//!
//! A [`DeviceProfile`] describes the phone screen and the viewer's lenses.
//! From it the [`RenderContext`] derives per-eye projections and viewports
//! and the [`DistortionMesh`], the [`StereoController`] places the eye
//! cameras around the scene camera, and the [`Compositor`] runs the final
//! correction pass through a [`CompositorBackend`] such as [`GpuBackend`].

pub mod compositor;
pub mod config;
pub mod context;
pub mod distortion;
pub mod error;
pub mod gpu;
pub mod mesh;
pub mod pose;
pub mod profile;
pub mod projection;
pub mod rig;
pub mod stereo;
pub mod tracker;
pub mod viewport;

pub use compositor::{Capabilities, Compositor, CompositorBackend, CorrectionStrategy, NativeDistortion};
pub use config::StereoConfig;
pub use context::{RenderContext, RenderTargetAllocator, StereoScreen};
pub use distortion::{DistortionModel, RadialDistortion};
pub use error::{Result, StereoError};
pub use gpu::GpuBackend;
pub use mesh::{DistortionMesh, DistortionMeshBuilder, MeshMode};
pub use pose::{FrameEvents, Pose3D, PoseSource};
pub use profile::{DeviceProfile, ScreenModel, ViewerModel};
pub use projection::{Distortion, Eye, ProjectionCalculator};
pub use rig::{FrameReport, StereoRig};
pub use stereo::{EyeRenderRequest, SceneRenderer, StereoController};
pub use tracker::{HeadTracker, SimulatedHeadTracker, TrackedPoseSource};
pub use viewport::{Rect, TanAngles};

/// Routes `log` output to logcat on Android. Elsewhere the host application
/// installs its own logger.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("CardboardStereo"),
    );
}
