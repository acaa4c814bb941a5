use std::sync::Arc;

use candle_core::Tensor;

use super::{DistRef, Distribution, IntoDist};
use crate::constraints::Constraint;
use crate::error::{GuideError, Result};
use crate::util::sum_rightmost;

/// Reinterprets the rightmost `reinterpreted` batch dims of `base` as event dims.
#[derive(Clone, Debug)]
pub struct Independent {
    base: DistRef,
    reinterpreted: usize,
}

impl Independent {
    pub fn new(base: impl IntoDist, reinterpreted: usize) -> Result<Self> {
        let base = base.into_dist();
        let batch_rank = base.batch_shape().len();
        if reinterpreted > batch_rank {
            return Err(GuideError::InvalidParameter(format!(
                "cannot reinterpret {} dims of a {} with batch shape {:?}",
                reinterpreted,
                base.name(),
                base.batch_shape()
            )));
        }
        Ok(Self {
            base,
            reinterpreted,
        })
    }

    pub fn base(&self) -> &DistRef {
        &self.base
    }
}

impl Distribution for Independent {
    fn name(&self) -> &'static str {
        "Independent"
    }

    fn support(&self) -> Constraint {
        self.base.support().independent(self.reinterpreted)
    }

    fn batch_shape(&self) -> Vec<usize> {
        let b = self.base.batch_shape();
        b[..b.len() - self.reinterpreted].to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        let b = self.base.batch_shape();
        let mut ret = b[b.len() - self.reinterpreted..].to_vec();
        ret.extend(self.base.event_shape());
        ret
    }

    fn sample(&self) -> Result<Tensor> {
        self.base.sample()
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        sum_rightmost(&self.base.log_prob(value)?, self.reinterpreted)
    }

    fn mean(&self) -> Result<Tensor> {
        self.base.mean()
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        let b = self.base.batch_shape();
        let mut base_shape = batch_shape.to_vec();
        base_shape.extend_from_slice(&b[b.len() - self.reinterpreted..]);
        Ok(Arc::new(Self::new(
            self.base.expand(&base_shape)?,
            self.reinterpreted,
        )?))
    }
}
