use std::f64::consts::PI;
use std::sync::Arc;

use candle_core::Tensor;

use super::{broadcast_params, DistRef, Distribution};
use crate::constraints::Constraint;
use crate::error::Result;

/// Cauchy(loc, scale); has no mean.
#[derive(Clone, Debug)]
pub struct Cauchy {
    loc: Tensor,
    scale: Tensor,
    batch_shape: Vec<usize>,
}

impl Cauchy {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        let (params, batch_shape) = broadcast_params(&[&loc, &scale])?;
        Ok(Self {
            loc: params[0].clone(),
            scale: params[1].clone(),
            batch_shape,
        })
    }
}

impl Distribution for Cauchy {
    fn name(&self) -> &'static str {
        "Cauchy"
    }

    fn support(&self) -> Constraint {
        Constraint::Real
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.batch_shape.clone()
    }

    fn sample(&self) -> Result<Tensor> {
        // loc + scale * tan(pi * (u - 0.5))
        let angle = self.loc.rand_like(0.0, 1.0)?.affine(PI, -0.5 * PI)?;
        let tan = (angle.sin()? / angle.cos()?)?;
        Ok((&self.loc + (tan * &self.scale)?)?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let z = value.broadcast_sub(&self.loc)?.broadcast_div(&self.scale)?;
        let lp = z.sqr()?.affine(1.0, 1.0)?.log()?.neg()?;
        Ok((lp.broadcast_sub(&self.scale.log()?)? - PI.ln())?)
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(Arc::new(Self::new(
            self.loc.broadcast_as(batch_shape)?,
            self.scale.broadcast_as(batch_shape)?,
        )?))
    }
}
