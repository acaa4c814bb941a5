//! Distributions that can appear at a sample site.
//!
//! Only what the guides need: sampling (reparameterized where the family
//! allows), batched log densities, means for initialization, and expansion
//! to a plate-determined batch shape.

mod bernoulli;
mod cauchy;
mod exponential;
mod independent;
mod normal;
mod transformed;
mod uniform;

use std::fmt;
use std::sync::Arc;

use candle_core::{Shape, Tensor};

use crate::constraints::Constraint;
use crate::error::{GuideError, Result};

pub use bernoulli::Bernoulli;
pub use cauchy::Cauchy;
pub use exponential::Exponential;
pub use independent::Independent;
pub use normal::{LogNormal, Normal};
pub use transformed::TransformedDistribution;
pub use uniform::Uniform;

pub type DistRef = Arc<dyn Distribution>;

pub trait Distribution: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn support(&self) -> Constraint;

    fn batch_shape(&self) -> Vec<usize>;

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    /// `batch_shape + event_shape`
    fn shape(&self) -> Vec<usize> {
        let mut ret = self.batch_shape();
        ret.extend(self.event_shape());
        ret
    }

    fn event_dim(&self) -> usize {
        self.event_shape().len()
    }

    /// Draw one value of shape `self.shape()`; differentiable for
    /// continuous families.
    fn sample(&self) -> Result<Tensor>;

    /// Log density, summed over event dims.
    fn log_prob(&self, value: &Tensor) -> Result<Tensor>;

    fn mean(&self) -> Result<Tensor> {
        Err(GuideError::UndefinedMoment {
            dist: self.name(),
            moment: "mean",
        })
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef>;
}

/// Conversion into a shared distribution handle.
pub trait IntoDist {
    fn into_dist(self) -> DistRef;
}

impl<D: Distribution + 'static> IntoDist for D {
    fn into_dist(self) -> DistRef {
        Arc::new(self)
    }
}

impl IntoDist for DistRef {
    fn into_dist(self) -> DistRef {
        self
    }
}

/// Broadcast every parameter to a common batch shape.
pub(crate) fn broadcast_params(params: &[&Tensor]) -> Result<(Vec<Tensor>, Vec<usize>)> {
    let mut shape = Shape::from(());
    for p in params {
        shape = shape.broadcast_shape_binary_op(p.shape(), "broadcast_params")?;
    }
    let ret = params
        .iter()
        .map(|p| p.broadcast_as(shape.clone()))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok((ret, shape.dims().to_vec()))
}
