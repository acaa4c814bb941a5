//! Guides that run the model themselves.
//!
//! An [`AutoMessenger`] executes its model with every latent `sample`
//! statement routed to a [`PosteriorStrategy`]. The strategy sees the
//! site's prior, the open plates, and every value realized upstream in the
//! same execution, and answers with either a distribution to draw from or a
//! point value. Because the model runs inside the guide, the guide may
//! depend on upstream values in arbitrary ways and needs no guide code per
//! model.

use std::collections::BTreeMap;

use candle_core::Tensor;
use log::trace;

use crate::config::AutoGuideConfig;
use crate::distributions::DistRef;
use crate::error::{GuideError, Result};
use crate::init::{InitLocFn, InitSite};
use crate::params::{GuideParams, ParamOwner};
use crate::plates::{Plate, PlateSpec};
use crate::reduce::{self, SharedPlates};
use crate::runtime::{trace_model, Model, SampleHandler, SampleSite, Sampled};
use crate::trace::Trace;
use crate::transforms::{biject_to, Transform};

/// A strategy's answer for one site.
#[derive(Clone, Debug)]
pub enum Posterior {
    Distribution(DistRef),
    /// Substitute this value; broadcast to the prior's shape.
    Value(Tensor),
}

pub trait PosteriorStrategy {
    fn get_posterior(&mut self, site: &SiteContext<'_>) -> Result<Posterior>;
}

pub trait MedianStrategy: PosteriorStrategy {
    /// A point summary of the posterior at `site`, constrained.
    fn get_posterior_median(&mut self, site: &SiteContext<'_>) -> Result<Tensor>;
}

/// Everything a strategy may look at while deciding one site.
pub struct SiteContext<'a> {
    name: &'a str,
    prior: &'a DistRef,
    plates: &'a [Plate],
    upstream: &'a Trace,
    outer: &'a [String],
    amortized: &'a [String],
}

impl<'a> SiteContext<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn prior(&self) -> &'a DistRef {
        self.prior
    }

    pub fn plates(&self) -> &'a [Plate] {
        self.plates
    }

    /// Value of a site already executed in this call.
    pub fn upstream_value(&self, name: &str) -> Result<Tensor> {
        self.upstream.value(name).cloned()
    }

    pub fn upstream(&self) -> &'a Trace {
        self.upstream
    }

    pub fn shared_plates(&self) -> SharedPlates<'a> {
        SharedPlates {
            outer: self.outer,
            amortized: self.amortized,
        }
    }

    /// See [`reduce::remove_outer_plates`].
    pub fn remove_outer_plates(&self, value: &Tensor, event_dim: usize) -> Result<Tensor> {
        reduce::remove_outer_plates(value, event_dim, self.plates, &self.shared_plates())
    }

    /// Bijection from unconstrained space onto the prior's support.
    pub fn biject_to_support(&self) -> Result<Transform> {
        let support = self.prior.support();
        biject_to(&support).map_err(|e| match e {
            GuideError::NoBijection(_) => GuideError::UnsupportedSupport {
                site: self.name.to_string(),
                support: support.to_string(),
                prior: format!("{:?}", self.prior),
            },
            other => other,
        })
    }

    /// Initial location in unconstrained space, in canonical parameter shape.
    pub fn init_unconstrained(
        &self,
        init_loc_fn: &InitLocFn,
        transform: &Transform,
    ) -> Result<Tensor> {
        let init = init_loc_fn.init(&InitSite {
            name: self.name,
            prior: self.prior,
        })?;
        let unconstrained = transform.inverse(&init)?.detach();
        self.remove_outer_plates(&unconstrained, transform.domain_event_dim())
    }
}

type Mode<S> = fn(&mut S, &SiteContext<'_>) -> Result<Posterior>;

fn median_mode<S: MedianStrategy>(strategy: &mut S, site: &SiteContext<'_>) -> Result<Posterior> {
    Ok(Posterior::Value(strategy.get_posterior_median(site)?))
}

struct Interceptor<'s, S> {
    strategy: &'s mut S,
    mode: Mode<S>,
    outer: Vec<String>,
    amortized: &'s [String],
}

impl<S> SampleHandler for Interceptor<'_, S> {
    fn sample(&mut self, site: &SampleSite<'_>, upstream: &Trace) -> Result<Sampled> {
        let ctx = SiteContext {
            name: site.name,
            prior: site.prior,
            plates: site.plates,
            upstream,
            outer: &self.outer,
            amortized: self.amortized,
        };
        match (self.mode)(&mut *self.strategy, &ctx)? {
            Posterior::Value(value) => {
                let value = value.broadcast_as(site.prior.shape())?.contiguous()?;
                trace!("site `{}`: point value {:?}", site.name, value.dims());
                Ok(Sampled {
                    value,
                    posterior: None,
                })
            }
            Posterior::Distribution(posterior) => {
                let batch_shape = site.prior.batch_shape();
                let posterior = if posterior.batch_shape() != batch_shape {
                    posterior.expand(&batch_shape)?
                } else {
                    posterior
                };
                let value = posterior.sample()?;
                trace!(
                    "site `{}`: drew {:?} from {}",
                    site.name,
                    value.dims(),
                    posterior.name()
                );
                Ok(Sampled {
                    value,
                    posterior: Some(posterior),
                })
            }
        }
    }
}

/// A guide that runs `model` and answers each latent site with `strategy`.
pub struct AutoMessenger<M, S> {
    model: M,
    amortized_plates: Vec<String>,
    strategy: S,
}

impl<M, S: PosteriorStrategy> AutoMessenger<M, S> {
    pub fn with_strategy(model: M, strategy: S, amortized_plates: Vec<String>) -> Self {
        Self {
            model,
            amortized_plates,
            strategy,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn amortized_plates(&self) -> &[String] {
        &self.amortized_plates
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// One draw from the guide: latent site name -> value.
    pub fn invoke<A>(&mut self, args: &A) -> Result<BTreeMap<String, Tensor>>
    where
        A: ?Sized,
        M: Model<A>,
    {
        self.invoke_in(args, &[])
    }

    /// As [`invoke`](Self::invoke), with `outer` plates already open around
    /// the call (e.g. vectorized particles).
    pub fn invoke_in<A>(
        &mut self,
        args: &A,
        outer: &[PlateSpec],
    ) -> Result<BTreeMap<String, Tensor>>
    where
        A: ?Sized,
        M: Model<A>,
    {
        Ok(self.trace_in(args, outer)?.latent_values())
    }

    /// Latent values ordered by site name.
    pub fn invoke_packed<A>(&mut self, args: &A) -> Result<Vec<Tensor>>
    where
        A: ?Sized,
        M: Model<A>,
    {
        Ok(self.invoke(args)?.into_values().collect())
    }

    /// Full record of one guide execution, usable for an ELBO.
    pub fn trace<A>(&mut self, args: &A) -> Result<Trace>
    where
        A: ?Sized,
        M: Model<A>,
    {
        self.trace_in(args, &[])
    }

    pub fn trace_in<A>(&mut self, args: &A, outer: &[PlateSpec]) -> Result<Trace>
    where
        A: ?Sized,
        M: Model<A>,
    {
        self.run(args, outer, S::get_posterior)
    }

    fn run<A>(&mut self, args: &A, outer: &[PlateSpec], mode: Mode<S>) -> Result<Trace>
    where
        A: ?Sized,
        M: Model<A>,
    {
        let mut handler = Interceptor {
            strategy: &mut self.strategy,
            mode,
            outer: outer.iter().map(|p| p.name().to_string()).collect(),
            amortized: &self.amortized_plates,
        };
        trace_model(&self.model, args, &mut handler, outer)
    }
}

impl<M, S: ParamOwner> AutoMessenger<M, S> {
    pub fn params(&self) -> &GuideParams {
        self.strategy.params()
    }
}

impl<M, S: MedianStrategy> AutoMessenger<M, S> {
    /// Point summary of every latent site; upstream sites feed downstream
    /// ones at their medians.
    pub fn median<A>(&mut self, args: &A) -> Result<BTreeMap<String, Tensor>>
    where
        A: ?Sized,
        M: Model<A>,
    {
        self.median_in(args, &[])
    }

    pub fn median_in<A>(
        &mut self,
        args: &A,
        outer: &[PlateSpec],
    ) -> Result<BTreeMap<String, Tensor>>
    where
        A: ?Sized,
        M: Model<A>,
    {
        Ok(self.run(args, outer, median_mode::<S>)?.latent_values())
    }
}

/// Validate a config and build the guide for a strategy constructor.
pub(crate) fn build<M, S, F>(
    model: M,
    config: AutoGuideConfig,
    strategy: F,
) -> Result<AutoMessenger<M, S>>
where
    S: PosteriorStrategy,
    F: FnOnce(InitLocFn, f64) -> S,
{
    let init_scale = config.init_scale;
    if !(init_scale > 0.0 && init_scale.is_finite()) {
        return Err(GuideError::InvalidInitScale(init_scale));
    }
    Ok(AutoMessenger::with_strategy(
        model,
        strategy(config.init_loc_fn, init_scale),
        config.amortized_plates,
    ))
}
