use candle_core::{DType, Tensor};

use crate::error::Result;

/// Sum out the rightmost `n` dims.
pub fn sum_rightmost(x: &Tensor, n: usize) -> Result<Tensor> {
    let mut ret = x.clone();
    for _ in 0..n.min(x.rank()) {
        ret = ret.sum(ret.rank() - 1)?;
    }
    Ok(ret)
}

/// softplus(x) = log(1 + exp(x)), computed as relu(x) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok((x.relu()? + tail)?)
}

pub fn all_finite(x: &Tensor) -> Result<bool> {
    let xs: Vec<f64> = x.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
    Ok(xs.iter().all(|v| v.is_finite()))
}
