use thiserror::Error;

/// Failures raised while running a model under a guide.
#[derive(Debug, Error)]
pub enum GuideError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("expected init_scale > 0. but got {0}")]
    InvalidInitScale(f64),

    #[error("site `{site}`: cannot transform to support {support} of prior {prior}")]
    UnsupportedSupport {
        site: String,
        support: String,
        prior: String,
    },

    #[error("no bijection to support {0}")]
    NoBijection(String),

    #[error("upstream site `{0}` has not been sampled in this execution")]
    UpstreamNotFound(String),

    #[error("site `{0}` is sampled more than once in one execution")]
    DuplicateSite(String),

    #[error("plate `{0}` is already active")]
    DuplicatePlate(String),

    #[error("plate `{name}` cannot use dim {dim}: already taken")]
    PlateDimConflict { name: String, dim: i64 },

    #[error("invalid plate `{name}`: {reason}")]
    InvalidPlate { name: String, reason: String },

    #[error("shape mismatch at `{site}`: {reason}")]
    ShapeMismatch { site: String, reason: String },

    #[error("{moment} is undefined for {dist}")]
    UndefinedMoment {
        dist: &'static str,
        moment: &'static str,
    },

    #[error("parameter `{0}` does not exist")]
    MissingParam(String),

    #[error("invalid distribution parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, GuideError>;
