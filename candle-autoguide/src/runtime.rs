//! Explicit model execution.
//!
//! A model is a function of a [`Runtime`] and its arguments. Every
//! `sample` statement is routed to a [`SampleHandler`], which decides the
//! value of the site; the runtime keeps the plate stack and records the
//! [`Trace`].

use std::collections::HashSet;

use candle_core::Tensor;
use log::trace;

use crate::distributions::{DistRef, IntoDist};
use crate::error::{GuideError, Result};
use crate::plates::{Plate, PlateSpec};
use crate::trace::{Trace, TraceSite};

pub trait Model<A: ?Sized> {
    fn run(&self, rt: &mut Runtime<'_>, args: &A) -> Result<()>;
}

impl<A: ?Sized, F> Model<A> for F
where
    F: Fn(&mut Runtime<'_>, &A) -> Result<()>,
{
    fn run(&self, rt: &mut Runtime<'_>, args: &A) -> Result<()> {
        self(rt, args)
    }
}

/// A latent site as seen by a handler.
pub struct SampleSite<'a> {
    pub name: &'a str,
    /// Broadcast against `plates`.
    pub prior: &'a DistRef,
    pub plates: &'a [Plate],
}

pub struct Sampled {
    pub value: Tensor,
    /// Distribution `value` was drawn from, if any.
    pub posterior: Option<DistRef>,
}

pub trait SampleHandler {
    /// Realize `site`; `upstream` holds every site executed before it.
    fn sample(&mut self, site: &SampleSite<'_>, upstream: &Trace) -> Result<Sampled>;
}

/// Draws every latent site from its prior.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorHandler;

impl SampleHandler for PriorHandler {
    fn sample(&mut self, site: &SampleSite<'_>, _upstream: &Trace) -> Result<Sampled> {
        Ok(Sampled {
            value: site.prior.sample()?,
            posterior: None,
        })
    }
}

pub struct Runtime<'a> {
    handler: &'a mut dyn SampleHandler,
    plates: Vec<Plate>,
    trace: Trace,
}

impl<'a> Runtime<'a> {
    pub fn new(handler: &'a mut dyn SampleHandler) -> Self {
        Self {
            handler,
            plates: vec![],
            trace: Trace::new(),
        }
    }

    /// Currently open plates, outermost first.
    pub fn plates(&self) -> &[Plate] {
        &self.plates
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    pub fn sample(&mut self, name: &str, prior: impl IntoDist) -> Result<Tensor> {
        if self.trace.contains(name) {
            return Err(GuideError::DuplicateSite(name.to_string()));
        }
        let prior = self.broadcast_to_plates(name, prior.into_dist())?;
        let site = SampleSite {
            name,
            prior: &prior,
            plates: &self.plates,
        };
        let Sampled { value, posterior } = self.handler.sample(&site, &self.trace)?;
        trace!(
            "site `{}`: {} {:?} -> {:?}",
            name,
            prior.name(),
            prior.shape(),
            value.dims()
        );
        self.trace.push(TraceSite {
            name: name.to_string(),
            prior,
            posterior,
            value: value.clone(),
            observed: false,
            plates: self.plates.clone(),
        })?;
        Ok(value)
    }

    /// Condition `name` on `value`. The handler is not consulted.
    pub fn observe(&mut self, name: &str, prior: impl IntoDist, value: &Tensor) -> Result<Tensor> {
        if self.trace.contains(name) {
            return Err(GuideError::DuplicateSite(name.to_string()));
        }
        let prior = self.broadcast_to_plates(name, prior.into_dist())?;
        self.trace.push(TraceSite {
            name: name.to_string(),
            prior,
            posterior: None,
            value: value.clone(),
            observed: true,
            plates: self.plates.clone(),
        })?;
        Ok(value.clone())
    }

    /// Run `body` inside the plate `spec`.
    pub fn plate<T, F>(&mut self, spec: &PlateSpec, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self, &Plate) -> Result<T>,
    {
        let plate = self.enter_plate(spec)?;
        let ret = body(self, &plate);
        self.plates.pop();
        ret
    }

    pub(crate) fn enter_plate(&mut self, spec: &PlateSpec) -> Result<Plate> {
        if self.plates.iter().any(|p| p.name() == spec.name()) {
            return Err(GuideError::DuplicatePlate(spec.name().to_string()));
        }
        let taken: HashSet<i64> = self.plates.iter().map(|p| p.dim()).collect();
        let dim = match spec.requested_dim() {
            Some(d) if taken.contains(&d) => {
                return Err(GuideError::PlateDimConflict {
                    name: spec.name().to_string(),
                    dim: d,
                })
            }
            Some(d) => d,
            None => {
                let mut d = -1;
                while taken.contains(&d) {
                    d -= 1;
                }
                d
            }
        };
        let plate = spec.activate(dim)?;
        self.plates.push(plate.clone());
        Ok(plate)
    }

    /// Expand `prior` so that each active plate owns its batch axis.
    fn broadcast_to_plates(&self, name: &str, prior: DistRef) -> Result<DistRef> {
        let original = prior.batch_shape();
        let needed = self
            .plates
            .iter()
            .map(|p| (-p.dim()) as usize)
            .max()
            .unwrap_or(0);
        let mut batch = original.clone();
        if batch.len() < needed {
            let mut padded = vec![1; needed - batch.len()];
            padded.extend(batch);
            batch = padded;
        }
        for p in self.plates.iter() {
            let ax = batch.len() - (-p.dim()) as usize;
            match batch[ax] {
                1 => batch[ax] = p.size(),
                n if n == p.size() => {}
                n => {
                    return Err(GuideError::ShapeMismatch {
                        site: name.to_string(),
                        reason: format!(
                            "batch axis {} has length {} inside plate `{}` of size {}",
                            ax,
                            n,
                            p.name(),
                            p.size()
                        ),
                    })
                }
            }
        }
        if batch == original {
            Ok(prior)
        } else {
            prior.expand(&batch)
        }
    }
}

/// Run `model` under `handler` inside the `outer` plates.
pub fn trace_model<A, M>(
    model: &M,
    args: &A,
    handler: &mut dyn SampleHandler,
    outer: &[PlateSpec],
) -> Result<Trace>
where
    A: ?Sized,
    M: Model<A> + ?Sized,
{
    let mut rt = Runtime::new(handler);
    for spec in outer {
        rt.enter_plate(spec)?;
    }
    model.run(&mut rt, args)?;
    Ok(rt.into_trace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use candle_core::Device;

    fn two_plates(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
        let dev = Device::Cpu;
        rt.plate(&PlateSpec::new("outer", 3), |rt, _| {
            rt.plate(&PlateSpec::new("inner", 4), |rt, inner| {
                assert_eq!(inner.dim(), -2);
                rt.sample("z", Normal::scalar(0.0, 1.0, &dev)?)
            })
        })?;
        Ok(())
    }

    #[test]
    fn test_prior_is_broadcast_against_plates() -> Result<()> {
        let tr = trace_model(&two_plates, &(), &mut PriorHandler, &[])?;
        let z = tr.get("z").map(|s| s.value.dims().to_vec());
        assert_eq!(z, Some(vec![4, 3]));
        Ok(())
    }

    #[test]
    fn test_plates_are_popped_on_error() -> Result<()> {
        let mut handler = PriorHandler;
        let mut rt = Runtime::new(&mut handler);
        let failed: Result<()> = rt.plate(&PlateSpec::new("data", 2), |_, _| {
            Err(GuideError::InvalidParameter("boom".into()))
        });
        assert!(failed.is_err());
        assert!(rt.plates().is_empty());
        Ok(())
    }

    #[test]
    fn test_plate_errors() -> Result<()> {
        let mut handler = PriorHandler;
        let mut rt = Runtime::new(&mut handler);
        let dup = rt.plate(&PlateSpec::new("data", 2), |rt, _| {
            rt.plate(&PlateSpec::new("data", 2), |_, _| Ok(()))
        });
        assert!(matches!(dup, Err(GuideError::DuplicatePlate(_))));

        let conflict = rt.plate(&PlateSpec::new("a", 2).dim(-1), |rt, _| {
            rt.plate(&PlateSpec::new("b", 2).dim(-1), |_, _| Ok(()))
        });
        assert!(matches!(conflict, Err(GuideError::PlateDimConflict { .. })));
        Ok(())
    }

    #[test]
    fn test_duplicate_site_and_shape_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let mut handler = PriorHandler;
        let mut rt = Runtime::new(&mut handler);
        rt.sample("a", Normal::scalar(0.0, 1.0, &dev)?)?;
        assert!(matches!(
            rt.sample("a", Normal::scalar(0.0, 1.0, &dev)?),
            Err(GuideError::DuplicateSite(_))
        ));

        let wrong = Normal::new(
            Tensor::zeros(3, candle_core::DType::F32, &dev)?,
            Tensor::new(1f32, &dev)?,
        )?;
        let res = rt.plate(&PlateSpec::new("data", 5), |rt, _| rt.sample("b", wrong));
        assert!(matches!(res, Err(GuideError::ShapeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_observe_bypasses_handler() -> Result<()> {
        let dev = Device::Cpu;
        let mut handler = PriorHandler;
        let mut rt = Runtime::new(&mut handler);
        let y = Tensor::new(&[0.5f32, 1.0], &dev)?;
        rt.plate(&PlateSpec::new("data", 2), |rt, _| {
            rt.observe("y", Normal::scalar(0.0, 1.0, &dev)?, &y)
        })?;
        let tr = rt.into_trace();
        assert!(tr.latent_values().is_empty());
        assert_eq!(tr.get("y").map(|s| s.observed), Some(true));
        Ok(())
    }
}
