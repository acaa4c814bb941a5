//! Plates: named, possibly subsampled batch dims.

use candle_core::{Device, Tensor};

use crate::error::{GuideError, Result};

/// Request to open a plate, as written in a model.
#[derive(Clone, Debug)]
pub struct PlateSpec {
    name: String,
    full_size: usize,
    subsample_size: Option<usize>,
    subsample: Option<Vec<u32>>,
    dim: Option<i64>,
}

impl PlateSpec {
    pub fn new(name: &str, full_size: usize) -> Self {
        Self {
            name: name.to_string(),
            full_size,
            subsample_size: None,
            subsample: None,
            dim: None,
        }
    }

    /// Draw a random minibatch of this many indices each time the plate opens.
    pub fn subsample_size(mut self, size: usize) -> Self {
        self.subsample_size = Some(size);
        self
    }

    /// Use exactly these indices.
    pub fn subsample(mut self, indices: Vec<u32>) -> Self {
        self.subsample = Some(indices);
        self
    }

    pub fn dim(mut self, dim: i64) -> Self {
        self.dim = Some(dim);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn requested_dim(&self) -> Option<i64> {
        self.dim
    }

    /// Resolve indices and bind the plate to `dim`.
    pub(crate) fn activate(&self, dim: i64) -> Result<Plate> {
        let invalid = |reason: String| GuideError::InvalidPlate {
            name: self.name.clone(),
            reason,
        };
        if dim >= 0 {
            return Err(invalid(format!("dim must be negative, got {}", dim)));
        }
        let indices: Vec<u32> = match (&self.subsample, self.subsample_size) {
            (Some(idx), _) => idx.clone(),
            (None, Some(size)) if size < self.full_size => {
                let mut rng = rand::rng();
                rand::seq::index::sample(&mut rng, self.full_size, size)
                    .into_iter()
                    .map(|i| i as u32)
                    .collect()
            }
            (None, Some(size)) if size > self.full_size => {
                return Err(invalid(format!(
                    "subsample size {} exceeds full size {}",
                    size, self.full_size
                )))
            }
            _ => (0..self.full_size as u32).collect(),
        };
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= self.full_size) {
            return Err(invalid(format!(
                "index {} out of range for full size {}",
                bad, self.full_size
            )));
        }
        Plate::with_indices(&self.name, dim, self.full_size, indices)
    }
}

/// A plate that is currently open.
#[derive(Clone, Debug)]
pub struct Plate {
    name: String,
    dim: i64,
    size: usize,
    full_size: usize,
    indices: Tensor,
}

impl Plate {
    /// A plate over the leading `size` of `full_size` entries.
    pub fn new(name: &str, dim: i64, size: usize, full_size: usize) -> Result<Self> {
        Self::with_indices(name, dim, full_size, (0..size as u32).collect())
    }

    pub fn with_indices(name: &str, dim: i64, full_size: usize, indices: Vec<u32>) -> Result<Self> {
        let size = indices.len();
        if size > full_size {
            return Err(GuideError::InvalidPlate {
                name: name.to_string(),
                reason: format!("size {} exceeds full size {}", size, full_size),
            });
        }
        Ok(Self {
            name: name.to_string(),
            dim,
            size,
            full_size,
            indices: Tensor::from_vec(indices, size, &Device::Cpu)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn full_size(&self) -> usize {
        self.full_size
    }

    pub fn is_subsampled(&self) -> bool {
        self.size != self.full_size
    }

    /// Subsample indices into the full extent (u32, on the cpu).
    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    /// `full_size / size`, the likelihood scale of a minibatch.
    pub fn scale(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.full_size as f64 / self.size as f64
        }
    }
}

/// Position of a negative `dim` in a tensor of `rank`, if the tensor has it.
pub(crate) fn axis(rank: usize, dim: i64) -> Option<usize> {
    let idx = rank as i64 + dim;
    (idx >= 0 && dim < 0).then_some(idx as usize)
}

/// Tile `value` periodically along `axis` until it has length `size`.
pub fn periodic_repeat(value: &Tensor, size: usize, axis: usize) -> Result<Tensor> {
    let period = value.dim(axis)?;
    if period == 0 {
        return Err(GuideError::InvalidParameter(
            "cannot periodically repeat an empty axis".into(),
        ));
    }
    let mut repeats = vec![1; value.rank()];
    repeats[axis] = size.div_ceil(period);
    Ok(value.repeat(repeats)?.narrow(axis, 0, size)?.contiguous()?)
}

/// Read a full-size parameter back at the current minibatch.
///
/// An axis of length 1 broadcasts and is left alone; any other length must
/// equal the plate's full size.
pub fn select_subsample(value: &Tensor, event_dim: usize, plates: &[Plate]) -> Result<Tensor> {
    let mut ret = value.clone();
    for f in plates.iter().filter(|f| f.is_subsampled()) {
        let Some(ax) = axis(ret.rank(), f.dim - event_dim as i64) else {
            continue;
        };
        let len = ret.dim(ax)?;
        if len == 1 {
            continue;
        }
        if len != f.full_size {
            return Err(GuideError::ShapeMismatch {
                site: f.name.clone(),
                reason: format!(
                    "parameter axis {} has length {}, expected plate full size {}",
                    ax, len, f.full_size
                ),
            });
        }
        let idx = f.indices.to_device(ret.device())?;
        ret = ret.index_select(&idx, ax)?;
    }
    Ok(ret)
}
