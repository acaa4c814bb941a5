use candle_core::{DType, Device, Tensor};

use super::{broadcast_params, DistRef, Distribution};
use crate::constraints::Constraint;
use crate::error::Result;

fn normal_log_prob(x: &Tensor, loc: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let z = x.broadcast_sub(loc)?.broadcast_div(scale)?;
    // -0.5 * z^2 - ln(scale) - 0.5 * ln(2pi)
    let lp = (z.sqr()? * (-0.5))?.broadcast_sub(&scale.log()?)?;
    Ok((lp - 0.5 * ln_2pi)?)
}

/// Normal(loc, scale)
#[derive(Clone, Debug)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
    batch_shape: Vec<usize>,
}

impl Normal {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        let (params, batch_shape) = broadcast_params(&[&loc, &scale])?;
        Ok(Self {
            loc: params[0].clone(),
            scale: params[1].clone(),
            batch_shape,
        })
    }

    /// A scalar f32 normal.
    pub fn scalar(loc: f32, scale: f32, device: &Device) -> Result<Self> {
        Self::new(Tensor::new(loc, device)?, Tensor::new(scale, device)?)
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn dtype(&self) -> DType {
        self.loc.dtype()
    }
}

impl Distribution for Normal {
    fn name(&self) -> &'static str {
        "Normal"
    }

    fn support(&self) -> Constraint {
        Constraint::Real
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.batch_shape.clone()
    }

    fn sample(&self) -> Result<Tensor> {
        let eps = self.loc.randn_like(0.0, 1.0)?;
        Ok((&self.loc + (eps * &self.scale)?)?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        normal_log_prob(value, &self.loc, &self.scale)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.loc.contiguous()?)
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(std::sync::Arc::new(Self::new(
            self.loc.broadcast_as(batch_shape)?,
            self.scale.broadcast_as(batch_shape)?,
        )?))
    }
}

/// exp(Normal(loc, scale))
#[derive(Clone, Debug)]
pub struct LogNormal {
    base: Normal,
}

impl LogNormal {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        Ok(Self {
            base: Normal::new(loc, scale)?,
        })
    }

    pub fn scalar(loc: f32, scale: f32, device: &Device) -> Result<Self> {
        Ok(Self {
            base: Normal::scalar(loc, scale, device)?,
        })
    }
}

impl Distribution for LogNormal {
    fn name(&self) -> &'static str {
        "LogNormal"
    }

    fn support(&self) -> Constraint {
        Constraint::Positive
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.base.batch_shape()
    }

    fn sample(&self) -> Result<Tensor> {
        Ok(self.base.sample()?.exp()?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let log_x = value.log()?;
        let lp = normal_log_prob(&log_x, &self.base.loc, &self.base.scale)?;
        Ok(lp.broadcast_sub(&log_x)?)
    }

    fn mean(&self) -> Result<Tensor> {
        let half_var = (self.base.scale.sqr()? * 0.5)?;
        Ok((&self.base.loc + half_var)?.exp()?)
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(std::sync::Arc::new(Self::new(
            self.base.loc.broadcast_as(batch_shape)?,
            self.base.scale.broadcast_as(batch_shape)?,
        )?))
    }
}
