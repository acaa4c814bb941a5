//! Bijections between unconstrained space and constrained supports.
//!
//! Every transform here is elementwise in its batch dims; `Affine` and
//! `Independent` may additionally treat rightmost dims as one event, which
//! only changes how `log_abs_det_jacobian` is summed.

use std::sync::{Arc, Mutex};

use candle_core::Tensor;
use candle_nn::ops;

use crate::constraints::Constraint;
use crate::error::{GuideError, Result};
use crate::util::{softplus, sum_rightmost};

const PROB_EPS: f64 = 1.2e-7;

type CacheSlot = Arc<Mutex<Option<(Tensor, Tensor)>>>;

#[derive(Clone, Debug)]
pub enum Transform {
    Identity,
    Exp,
    /// y = lb + exp(x)
    LowerBound(f64),
    /// y = ub - exp(x)
    UpperBound(f64),
    Sigmoid,
    /// y = lo + (hi - lo) * sigmoid(x)
    Interval(f64, f64),
    /// y = loc + scale * x
    Affine {
        loc: Tensor,
        scale: Tensor,
        event_dim: usize,
    },
    Independent {
        base: Box<Transform>,
        reinterpreted: usize,
    },
    Compose(Vec<Transform>),
    Inverse(Box<Transform>),
    /// Remembers the last `(x, y)` pair, keyed by tensor identity.
    Cached { base: Box<Transform>, cache: CacheSlot },
}

impl Transform {
    pub fn affine(loc: Tensor, scale: Tensor, event_dim: usize) -> Self {
        Transform::Affine {
            loc,
            scale,
            event_dim,
        }
    }

    pub fn inv(&self) -> Self {
        match self {
            Transform::Inverse(base) => (**base).clone(),
            other => Transform::Inverse(Box::new(other.clone())),
        }
    }

    pub fn with_cache(&self) -> Self {
        match self {
            Transform::Cached { .. } => self.clone(),
            other => Transform::Cached {
                base: Box::new(other.clone()),
                cache: Arc::new(Mutex::new(None)),
            },
        }
    }

    pub fn domain_event_dim(&self) -> usize {
        match self {
            Transform::Affine { event_dim, .. } => *event_dim,
            Transform::Independent {
                base,
                reinterpreted,
            } => base.domain_event_dim() + reinterpreted,
            Transform::Compose(parts) => parts
                .iter()
                .map(|p| p.domain_event_dim())
                .max()
                .unwrap_or(0),
            Transform::Inverse(base) => base.codomain_event_dim(),
            Transform::Cached { base, .. } => base.domain_event_dim(),
            _ => 0,
        }
    }

    pub fn codomain_event_dim(&self) -> usize {
        match self {
            Transform::Inverse(base) => base.domain_event_dim(),
            Transform::Cached { base, .. } => base.codomain_event_dim(),
            Transform::Compose(parts) => parts
                .iter()
                .map(|p| p.codomain_event_dim())
                .max()
                .unwrap_or(0),
            _ => self.domain_event_dim(),
        }
    }

    pub fn domain(&self) -> Constraint {
        match self {
            Transform::Affine { event_dim, .. } => Constraint::Real.independent(*event_dim),
            Transform::Independent {
                base,
                reinterpreted,
            } => base.domain().independent(*reinterpreted),
            Transform::Compose(parts) => parts
                .first()
                .map(|p| p.domain())
                .unwrap_or(Constraint::Real),
            Transform::Inverse(base) => base.codomain(),
            Transform::Cached { base, .. } => base.domain(),
            _ => Constraint::Real,
        }
    }

    pub fn codomain(&self) -> Constraint {
        match self {
            Transform::Identity => Constraint::Real,
            Transform::Exp => Constraint::Positive,
            Transform::LowerBound(lb) => Constraint::GreaterThan(*lb),
            Transform::UpperBound(ub) => Constraint::LessThan(*ub),
            Transform::Sigmoid => Constraint::UnitInterval,
            Transform::Interval(lo, hi) => Constraint::Interval(*lo, *hi),
            Transform::Affine { event_dim, .. } => Constraint::Real.independent(*event_dim),
            Transform::Independent {
                base,
                reinterpreted,
            } => base.codomain().independent(*reinterpreted),
            Transform::Compose(parts) => parts
                .last()
                .map(|p| p.codomain())
                .unwrap_or(Constraint::Real),
            Transform::Inverse(base) => base.domain(),
            Transform::Cached { base, .. } => base.codomain(),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Transform::Identity => x.clone(),
            Transform::Exp => x.exp()?,
            Transform::LowerBound(lb) => (x.exp()? + *lb)?,
            Transform::UpperBound(ub) => x.exp()?.affine(-1.0, *ub)?,
            Transform::Sigmoid => ops::sigmoid(x)?,
            Transform::Interval(lo, hi) => ops::sigmoid(x)?.affine(hi - lo, *lo)?,
            Transform::Affine { loc, scale, .. } => x.broadcast_mul(scale)?.broadcast_add(loc)?,
            Transform::Independent { base, .. } => base.forward(x)?,
            Transform::Compose(parts) => {
                let mut y = x.clone();
                for p in parts {
                    y = p.forward(&y)?;
                }
                y
            }
            Transform::Inverse(base) => base.inverse(x)?,
            Transform::Cached { base, cache } => {
                if let Some((_, y)) = lookup(cache, |(cx, _)| cx.id() == x.id()) {
                    return Ok(y);
                }
                let y = base.forward(x)?;
                store(cache, x, &y);
                y
            }
        };
        Ok(y)
    }

    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        let x = match self {
            Transform::Identity => y.clone(),
            Transform::Exp => y.log()?,
            Transform::LowerBound(lb) => (y - *lb)?.log()?,
            Transform::UpperBound(ub) => y.affine(-1.0, *ub)?.log()?,
            Transform::Sigmoid => logit(y)?,
            Transform::Interval(lo, hi) => {
                let width = hi - lo;
                logit(&y.affine(1.0 / width, -lo / width)?)?
            }
            Transform::Affine { loc, scale, .. } => y.broadcast_sub(loc)?.broadcast_div(scale)?,
            Transform::Independent { base, .. } => base.inverse(y)?,
            Transform::Compose(parts) => {
                let mut x = y.clone();
                for p in parts.iter().rev() {
                    x = p.inverse(&x)?;
                }
                x
            }
            Transform::Inverse(base) => base.forward(y)?,
            Transform::Cached { base, cache } => {
                if let Some((x, _)) = lookup(cache, |(_, cy)| cy.id() == y.id()) {
                    return Ok(x);
                }
                let x = base.inverse(y)?;
                store(cache, &x, y);
                x
            }
        };
        Ok(x)
    }

    /// log |dy/dx| summed over the domain event dims.
    pub fn log_abs_det_jacobian(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let ladj = match self {
            Transform::Identity => x.zeros_like()?,
            Transform::Exp | Transform::LowerBound(_) | Transform::UpperBound(_) => x.clone(),
            Transform::Sigmoid => sigmoid_ladj(x)?,
            Transform::Interval(lo, hi) => (sigmoid_ladj(x)? + (hi - lo).ln())?,
            Transform::Affine {
                scale, event_dim, ..
            } => {
                let shape = x.shape().broadcast_shape_binary_op(scale.shape(), "affine")?;
                let ladj = scale.abs()?.log()?.broadcast_as(shape)?;
                sum_rightmost(&ladj, *event_dim)?
            }
            Transform::Independent {
                base,
                reinterpreted,
            } => sum_rightmost(&base.log_abs_det_jacobian(x, y)?, *reinterpreted)?,
            Transform::Compose(parts) => {
                let event_dim = self.domain_event_dim();
                let mut total: Option<Tensor> = None;
                let mut xi = x.clone();
                for p in parts {
                    let yi = p.forward(&xi)?;
                    let term = sum_rightmost(
                        &p.log_abs_det_jacobian(&xi, &yi)?,
                        event_dim - p.domain_event_dim(),
                    )?;
                    total = Some(match total {
                        Some(t) => t.broadcast_add(&term)?,
                        None => term,
                    });
                    xi = yi;
                }
                match total {
                    Some(t) => t,
                    None => sum_rightmost(&x.zeros_like()?, event_dim)?,
                }
            }
            Transform::Inverse(base) => base.log_abs_det_jacobian(y, x)?.neg()?,
            Transform::Cached { base, .. } => base.log_abs_det_jacobian(x, y)?,
        };
        Ok(ladj)
    }
}

/// The bijection from unconstrained space onto `constraint`.
pub fn biject_to(constraint: &Constraint) -> Result<Transform> {
    let t = match constraint {
        Constraint::Real => Transform::Identity,
        Constraint::Positive => Transform::Exp,
        Constraint::GreaterThan(lb) => Transform::LowerBound(*lb),
        Constraint::LessThan(ub) => Transform::UpperBound(*ub),
        Constraint::UnitInterval => Transform::Sigmoid,
        Constraint::Interval(lo, hi) => Transform::Interval(*lo, *hi),
        Constraint::Independent(base, n) => Transform::Independent {
            base: Box::new(biject_to(base)?),
            reinterpreted: *n,
        },
        Constraint::Boolean | Constraint::IntegerInterval(..) => {
            return Err(GuideError::NoBijection(constraint.to_string()))
        }
    };
    Ok(t)
}

fn logit(p: &Tensor) -> Result<Tensor> {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    Ok((p.log()? - p.affine(-1.0, 1.0)?.log()?)?)
}

fn sigmoid_ladj(x: &Tensor) -> Result<Tensor> {
    Ok((softplus(&x.neg()?)? + softplus(x)?)?.neg()?)
}

fn lookup(
    cache: &CacheSlot,
    hit: impl Fn(&(Tensor, Tensor)) -> bool,
) -> Option<(Tensor, Tensor)> {
    // the slot holds a plain pair, so a panic elsewhere cannot leave it half-written
    let slot = cache.lock().unwrap_or_else(|e| e.into_inner());
    slot.as_ref().filter(|pair| hit(pair)).cloned()
}

fn store(cache: &CacheSlot, x: &Tensor, y: &Tensor) {
    let mut slot = cache.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some((x.clone(), y.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
        Ok((a - b)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?)
    }

    #[test]
    fn test_round_trip_all_supports() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-2.0f64, -0.3, 0.0, 0.7, 1.9], &dev)?;
        let supports = [
            Constraint::Real,
            Constraint::Positive,
            Constraint::GreaterThan(3.0),
            Constraint::LessThan(-1.0),
            Constraint::UnitInterval,
            Constraint::Interval(-2.0, 5.0),
            Constraint::Real.independent(1),
        ];
        for support in supports.iter() {
            let t = biject_to(support)?;
            let y = t.forward(&x)?;
            assert!(support.check(&y)?, "{} not satisfied", support);
            let x_back = t.inverse(&y)?;
            assert!(max_abs_diff(&x, &x_back)? < 1e-6, "round trip failed for {}", support);
        }
        Ok(())
    }

    #[test]
    fn test_discrete_support_has_no_bijection() {
        assert!(matches!(
            biject_to(&Constraint::Boolean),
            Err(GuideError::NoBijection(_))
        ));
    }

    #[test]
    fn test_sigmoid_ladj_numeric() -> Result<()> {
        let x = Tensor::new(&[0.4f64], &Device::Cpu)?;
        let t = Transform::Sigmoid;
        let y = t.forward(&x)?;
        let s: f64 = y.get(0)?.to_scalar()?;
        let ladj: f64 = t.log_abs_det_jacobian(&x, &y)?.get(0)?.to_scalar()?;
        assert_abs_diff_eq!(ladj, (s * (1.0 - s)).ln(), epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_affine_event_dim_sums() -> Result<()> {
        let dev = Device::Cpu;
        let loc = Tensor::zeros(3, DType::F64, &dev)?;
        let scale = Tensor::new(&[1.0f64, 2.0, 4.0], &dev)?;
        let t = Transform::affine(loc, scale, 1);
        let x = Tensor::ones((2, 3), DType::F64, &dev)?;
        let y = t.forward(&x)?;
        let ladj = t.log_abs_det_jacobian(&x, &y)?;
        assert_eq!(ladj.dims(), &[2]);
        assert_abs_diff_eq!(ladj.get(1)?.to_scalar::<f64>()?, 8f64.ln(), epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_cache_returns_exact_preimage() -> Result<()> {
        let t = Transform::Sigmoid.with_cache();
        let x = Tensor::new(&[30.0f32], &Device::Cpu)?;
        let y = t.forward(&x)?;
        // sigmoid(30) rounds to 1.0 in f32, so only the cache recovers x
        let x_back = t.inverse(&y)?;
        assert_eq!(x_back.id(), x.id());
        Ok(())
    }

    #[test]
    fn test_poisoned_cache_still_returns_preimage() -> Result<()> {
        let t = Transform::Sigmoid.with_cache();
        let x = Tensor::new(&[30.0f32], &Device::Cpu)?;
        let y = t.forward(&x)?;

        let Transform::Cached { cache, .. } = &t else {
            panic!("with_cache did not wrap the transform");
        };
        let held = cache.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.lock();
            panic!("panicked while holding the cache");
        })
        .join();
        assert!(cache.is_poisoned());

        assert_eq!(t.inverse(&y)?.id(), x.id());
        let z = Tensor::new(&[-0.5f32], &Device::Cpu)?;
        let w = t.forward(&z)?;
        assert_eq!(t.inverse(&w)?.id(), z.id());
        Ok(())
    }

    #[test]
    fn test_compose_with_inverse_is_identity() -> Result<()> {
        let dev = Device::Cpu;
        let t = biject_to(&Constraint::Positive)?;
        let shift = Transform::affine(
            Tensor::new(0.5f64, &dev)?,
            Tensor::new(2.0f64, &dev)?,
            0,
        );
        let chain = Transform::Compose(vec![t.inv(), shift, t.clone()]);
        let y = Tensor::new(&[0.5f64, 3.0], &dev)?;
        let z = chain.forward(&y)?;
        assert!(max_abs_diff(&chain.inverse(&z)?, &y)? < 1e-10);
        assert_eq!(chain.codomain(), Constraint::Positive);
        Ok(())
    }
}
