use std::sync::Arc;

use candle_core::Tensor;

use super::{DistRef, Distribution};
use crate::constraints::Constraint;
use crate::error::Result;

const PROB_EPS: f64 = 1e-7;

/// Bernoulli(probs); discrete, so no guide in this crate can learn it.
#[derive(Clone, Debug)]
pub struct Bernoulli {
    probs: Tensor,
}

impl Bernoulli {
    pub fn new(probs: Tensor) -> Result<Self> {
        Ok(Self { probs })
    }
}

impl Distribution for Bernoulli {
    fn name(&self) -> &'static str {
        "Bernoulli"
    }

    fn support(&self) -> Constraint {
        Constraint::Boolean
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.probs.dims().to_vec()
    }

    fn sample(&self) -> Result<Tensor> {
        let u = self.probs.rand_like(0.0, 1.0)?;
        Ok(u.lt(&self.probs)?.to_dtype(self.probs.dtype())?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let p = self.probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
        let on = value.broadcast_mul(&p.log()?)?;
        let off = value
            .affine(-1.0, 1.0)?
            .broadcast_mul(&p.affine(-1.0, 1.0)?.log()?)?;
        Ok((on + off)?)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.probs.clone())
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(Arc::new(Self::new(self.probs.broadcast_as(batch_shape)?)?))
    }
}
