use thiserror::Error;

/// Library error type for stereo rendering setup.
///
/// Geometry never fails; only configuration loading, native profile
/// decoding and render target allocation can.
#[derive(Debug, Error)]
pub enum StereoError {
    /// Underlying IO error while reading a config file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// Configuration parsed but holds values we cannot use.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The stereo screen could not be allocated.
    #[error("failed to allocate render target: {0}")]
    RenderTargetAllocation(String),

    /// A native profile parameter block had the wrong length.
    #[error("invalid profile data: expected {expected} values, got {actual}")]
    InvalidProfileData { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, StereoError>;
