use thiserror::Error;

/// Unrecoverable failures. Everything else (sensor gaps, rejected measurements,
/// degenerate scans) is reported as a status value and never reaches this type.
#[derive(Debug, Error)]
pub enum Error {
    /// `init_global_map` was called on a voxel map that already holds points.
    #[error("voxel map is already populated, refusing to load a prior map over it")]
    MapAlreadyInitialized,

    /// The prior map is too sparse to localize against.
    #[error("prior map has {found} points, at least {required} are required")]
    TooFewMapPoints { found: usize, required: usize },

    /// Prior-map localization was requested but no map was supplied.
    #[error("prior map mode is enabled but no prior map was provided")]
    PriorMapMissing,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The nonlinear least-squares back end failed to optimize, or lost a
    /// frame it was given.
    #[error("graph back end failed: {0}")]
    Backend(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
