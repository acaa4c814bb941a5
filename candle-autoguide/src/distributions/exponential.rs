use std::sync::Arc;

use candle_core::Tensor;

use super::{DistRef, Distribution};
use crate::constraints::Constraint;
use crate::error::Result;

/// Exponential(rate)
#[derive(Clone, Debug)]
pub struct Exponential {
    rate: Tensor,
}

impl Exponential {
    pub fn new(rate: Tensor) -> Result<Self> {
        Ok(Self { rate })
    }
}

impl Distribution for Exponential {
    fn name(&self) -> &'static str {
        "Exponential"
    }

    fn support(&self) -> Constraint {
        Constraint::Positive
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.rate.dims().to_vec()
    }

    fn sample(&self) -> Result<Tensor> {
        // inverse cdf: -log(1 - u) / rate
        let u = self.rate.rand_like(0.0, 1.0)?;
        Ok(u.affine(-1.0, 1.0)?.log()?.neg()?.broadcast_div(&self.rate)?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let lp = value.broadcast_mul(&self.rate)?.neg()?;
        Ok(lp.broadcast_add(&self.rate.log()?)?)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.rate.recip()?)
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(Arc::new(Self::new(self.rate.broadcast_as(batch_shape)?)?))
    }
}
