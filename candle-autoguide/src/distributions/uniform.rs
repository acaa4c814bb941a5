use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::{DistRef, Distribution};
use crate::constraints::Constraint;
use crate::error::{GuideError, Result};

/// Uniform(low, high) with scalar bounds.
#[derive(Clone, Debug)]
pub struct Uniform {
    low: f64,
    high: f64,
    batch_shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl Uniform {
    pub fn new(low: f64, high: f64, dtype: DType, device: &Device) -> Result<Self> {
        if !(low < high) {
            return Err(GuideError::InvalidParameter(format!(
                "Uniform requires low < high, got ({}, {})",
                low, high
            )));
        }
        Ok(Self {
            low,
            high,
            batch_shape: vec![],
            dtype,
            device: device.clone(),
        })
    }
}

impl Distribution for Uniform {
    fn name(&self) -> &'static str {
        "Uniform"
    }

    fn support(&self) -> Constraint {
        Constraint::Interval(self.low, self.high)
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.batch_shape.clone()
    }

    fn sample(&self) -> Result<Tensor> {
        let u = Tensor::rand(0f32, 1f32, self.batch_shape.clone(), &self.device)?;
        Ok(u.to_dtype(self.dtype)?.affine(self.high - self.low, self.low)?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let inside = value.ge(self.low)?.mul(&value.le(self.high)?)?;
        let ones = value.ones_like()?;
        let lp_in = ones.affine(0.0, -(self.high - self.low).ln())?;
        let lp_out = ones.affine(0.0, f64::NEG_INFINITY)?;
        Ok(inside.where_cond(&lp_in, &lp_out)?)
    }

    fn mean(&self) -> Result<Tensor> {
        let mid = 0.5 * (self.low + self.high);
        Ok(Tensor::ones(self.batch_shape.clone(), self.dtype, &self.device)?.affine(mid, 0.0)?)
    }

    fn expand(&self, batch_shape: &[usize]) -> Result<DistRef> {
        Ok(Arc::new(Self {
            batch_shape: batch_shape.to_vec(),
            ..self.clone()
        }))
    }
}
