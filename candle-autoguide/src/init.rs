//! Strategies for the initial constrained value of a guide parameter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use crate::distributions::DistRef;
use crate::error::{GuideError, Result};
use crate::transforms::biject_to;
use crate::util::all_finite;

/// What an initialization strategy gets to see.
pub struct InitSite<'a> {
    pub name: &'a str,
    pub prior: &'a DistRef,
}

pub type CustomInitFn = Arc<dyn Fn(&InitSite<'_>) -> Result<Tensor> + Send + Sync>;

#[derive(Clone)]
pub enum InitLocFn {
    /// Prior mean; `fallback` where the mean is undefined, not finite or
    /// outside the support.
    Mean { fallback: Box<InitLocFn> },
    /// The image of zero in unconstrained space.
    Feasible,
    /// One prior draw.
    Sample,
    /// Uniform on `(-radius, radius)` in unconstrained space.
    Uniform { radius: f64 },
    /// Fixed values by site name; `fallback` elsewhere.
    Values {
        values: Arc<HashMap<String, Tensor>>,
        fallback: Box<InitLocFn>,
    },
    Custom(CustomInitFn),
}

impl Default for InitLocFn {
    fn default() -> Self {
        InitLocFn::Mean {
            fallback: Box::new(InitLocFn::Feasible),
        }
    }
}

impl fmt::Debug for InitLocFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitLocFn::Mean { fallback } => write!(f, "Mean(fallback={:?})", fallback),
            InitLocFn::Feasible => write!(f, "Feasible"),
            InitLocFn::Sample => write!(f, "Sample"),
            InitLocFn::Uniform { radius } => write!(f, "Uniform(radius={})", radius),
            InitLocFn::Values { values, fallback } => {
                let mut names: Vec<&String> = values.keys().collect();
                names.sort();
                write!(f, "Values({:?}, fallback={:?})", names, fallback)
            }
            InitLocFn::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl InitLocFn {
    pub fn values(values: HashMap<String, Tensor>) -> Self {
        InitLocFn::Values {
            values: Arc::new(values),
            fallback: Box::new(InitLocFn::default()),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&InitSite<'_>) -> Result<Tensor> + Send + Sync + 'static,
    {
        InitLocFn::Custom(Arc::new(f))
    }

    /// A constrained initial value of shape `site.prior.shape()`, detached.
    pub fn init(&self, site: &InitSite<'_>) -> Result<Tensor> {
        let value = match self {
            InitLocFn::Mean { fallback } => match site.prior.mean() {
                Ok(v) if all_finite(&v)? && site.prior.support().check(&v)? => v,
                Ok(_) | Err(GuideError::UndefinedMoment { .. }) => fallback.init(site)?,
                Err(e) => return Err(e),
            },
            InitLocFn::Feasible => {
                let t = biject_to(&site.prior.support())?;
                let x = site.prior.sample()?.detach();
                t.forward(&t.inverse(&x)?.zeros_like()?)?
            }
            InitLocFn::Sample => site.prior.sample()?,
            InitLocFn::Uniform { radius } => {
                let t = biject_to(&site.prior.support())?;
                let x = site.prior.sample()?.detach();
                t.forward(&t.inverse(&x)?.rand_like(-radius, *radius)?)?
            }
            InitLocFn::Values { values, fallback } => match values.get(site.name) {
                Some(v) => v.clone(),
                None => fallback.init(site)?,
            },
            InitLocFn::Custom(f) => f(site)?,
        };
        Ok(value.broadcast_as(site.prior.shape())?.contiguous()?.detach())
    }
}
