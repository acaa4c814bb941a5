//! Canonical initial values for lazily created guide parameters.
//!
//! The first call of a guide may happen inside particle plates, on a
//! minibatch, or inside an amortized plate. None of these should leak into
//! the shape of a stored parameter.

use candle_core::Tensor;

use crate::error::Result;
use crate::plates::{axis, periodic_repeat, Plate};

/// Plates whose axes are averaged away rather than kept.
#[derive(Clone, Copy, Debug)]
pub struct SharedPlates<'a> {
    /// Plates that were already open when the guide was called.
    pub outer: &'a [String],
    /// Plates over which guide parameters are shared by configuration.
    pub amortized: &'a [String],
}

impl SharedPlates<'_> {
    pub fn contains(&self, plate: &Plate) -> bool {
        let name = plate.name();
        self.outer.iter().any(|n| n == name) || self.amortized.iter().any(|n| n == name)
    }
}

/// Collapse outer and amortized plate axes to their mean, tile subsampled
/// data plates out to full size, then drop leading size-1 batch axes.
///
/// `value` has shape `batch_shape + event_shape` with `event_dim` event dims.
pub fn remove_outer_plates(
    value: &Tensor,
    event_dim: usize,
    active_plates: &[Plate],
    shared: &SharedPlates<'_>,
) -> Result<Tensor> {
    let mut value = value.detach();
    for f in active_plates {
        let dim = f.dim() - event_dim as i64;
        let Some(ax) = axis(value.rank(), dim) else {
            continue;
        };
        if shared.contains(f) {
            value = value.mean_keepdim(ax)?;
        } else if f.is_subsampled() {
            value = periodic_repeat(&value, f.full_size(), ax)?;
        }
    }
    let batch_rank = value.rank().saturating_sub(event_dim);
    for _ in 0..batch_rank {
        if value.dim(0)? != 1 {
            break;
        }
        value = value.squeeze(0)?;
    }
    Ok(value.contiguous()?)
}
