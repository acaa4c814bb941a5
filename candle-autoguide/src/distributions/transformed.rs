use std::sync::Arc;

use candle_core::Tensor;

use super::{DistRef, Distribution, IntoDist};
use crate::constraints::Constraint;
use crate::error::Result;
use crate::transforms::Transform;
use crate::util::sum_rightmost;

/// Push-forward of `base` through a chain of transforms.
///
/// Sampling records each `(x, y)` pair in any cached transform, so the log
/// density of a value drawn from this distribution inverts exactly.
#[derive(Clone, Debug)]
pub struct TransformedDistribution {
    base: DistRef,
    transforms: Vec<Transform>,
    event_dim: usize,
}

impl TransformedDistribution {
    pub fn new(base: impl IntoDist, transforms: Vec<Transform>) -> Result<Self> {
        let base = base.into_dist();
        let event_dim = transforms
            .iter()
            .map(|t| t.domain_event_dim().max(t.codomain_event_dim()))
            .fold(base.event_dim(), usize::max);
        Ok(Self {
            base,
            transforms,
            event_dim,
        })
    }

    pub fn base(&self) -> &DistRef {
        &self.base
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }
}

impl Distribution for TransformedDistribution {
    fn name(&self) -> &'static str {
        "TransformedDistribution"
    }

    fn support(&self) -> Constraint {
        let support = match self.transforms.last() {
            Some(t) => t.codomain(),
            None => self.base.support(),
        };
        let extra = self.event_dim.saturating_sub(support.event_dim());
        support.independent(extra)
    }

    fn batch_shape(&self) -> Vec<usize> {
        let shape = self.base.shape();
        shape[..shape.len() - self.event_dim].to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        let shape = self.base.shape();
        shape[shape.len() - self.event_dim..].to_vec()
    }

    fn sample(&self) -> Result<Tensor> {
        let mut x = self.base.sample()?;
        for t in self.transforms.iter() {
            x = t.forward(&x)?;
        }
        Ok(x)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let mut y = value.clone();
        let mut lp: Option<Tensor> = None;
        for t in self.transforms.iter().rev() {
            let x = t.inverse(&y)?;
            let ladj = sum_rightmost(
                &t.log_abs_det_jacobian(&x, &y)?,
                self.event_dim - t.codomain_event_dim(),
            )?;
            lp = Some(match lp {
                Some(acc) => acc.broadcast_sub(&ladj)?,
                None => ladj.neg()?,
            });
            y = x;
        }
        let base_lp = sum_rightmost(
            &self.base.log_prob(&y)?,
            self.event_dim - self.base.event_dim(),
        )?;
        Ok(match lp {
            Some(acc) => base_lp.broadcast_add(&acc)?,
            None => base_lp,
        })
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        let base_extra = self.event_dim - self.base.event_dim();
        let mut base_batch = batch_shape.to_vec();
        base_batch.extend_from_slice(&self.event_shape()[..base_extra]);
        Ok(Arc::new(Self {
            base: self.base.expand(&base_batch)?,
            transforms: self.transforms.clone(),
            event_dim: self.event_dim,
        }))
    }
}
