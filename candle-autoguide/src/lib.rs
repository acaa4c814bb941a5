pub mod auto_normal;
pub mod auto_regressive;
pub mod cli;
pub mod config;
pub mod constraints;
pub mod distributions;
pub mod error;
pub mod init;
pub mod messenger;
pub mod params;
pub mod plates;
pub mod reduce;
pub mod runtime;
pub mod trace;
pub mod transforms;
pub mod util;

pub use auto_normal::{AutoNormalMessenger, MeanFieldPosterior};
pub use auto_regressive::{AutoRegressiveMessenger, RegressivePosterior};
pub use config::AutoGuideConfig;
pub use error::{GuideError, Result};
pub use init::{InitLocFn, InitSite};
pub use messenger::{AutoMessenger, MedianStrategy, Posterior, PosteriorStrategy, SiteContext};
pub use params::{GuideParams, ParamConstraint, ParamOwner, SiteParams};
pub use plates::{Plate, PlateSpec};
pub use runtime::{Model, PriorHandler, Runtime, SampleHandler};
pub use trace::{Trace, TraceSite};

pub use candle_core;
pub use candle_nn;
