//! Autoregressive guide: each site's posterior is its own prior, nudged by a
//! learned affine map in unconstrained space.
//!
//! Since the prior at a site is built from upstream values already drawn
//! from the guide, the posterior inherits the model's dependency structure
//! while only `(loc, scale)` per site is learned. At initialization the map
//! sends a prior draw `x` to roughly `init_scale * x + (1 - init_scale) * x0`
//! for the initial guess `x0`.
//!
//! Only continuous sites are supported. There is no median.

use candle_core::Tensor;

use crate::auto_normal::ensure_site_params;
use crate::config::AutoGuideConfig;
use crate::distributions::{IntoDist, TransformedDistribution};
use crate::error::Result;
use crate::init::InitLocFn;
use crate::messenger::{build, AutoMessenger, Posterior, PosteriorStrategy, SiteContext};
use crate::params::{GuideParams, ParamOwner};
use crate::transforms::Transform;

pub struct RegressivePosterior {
    params: GuideParams,
    init_loc_fn: InitLocFn,
    init_scale: f64,
}

impl RegressivePosterior {
    pub fn new(init_loc_fn: InitLocFn, init_scale: f64) -> Self {
        Self {
            params: GuideParams::new(),
            init_loc_fn,
            init_scale,
        }
    }

    pub fn params_mut(&mut self) -> &mut GuideParams {
        &mut self.params
    }

    pub fn init_scale(&self) -> f64 {
        self.init_scale
    }

    pub fn get_loc_scale(
        &mut self,
        site: &SiteContext<'_>,
        transform: &Transform,
    ) -> Result<(Tensor, Tensor)> {
        let keep = 1.0 - self.init_scale;
        ensure_site_params(
            &mut self.params,
            site,
            transform,
            &self.init_loc_fn,
            self.init_scale,
            |canonical| Ok((canonical * keep)?),
        )
    }
}

impl ParamOwner for RegressivePosterior {
    fn params(&self) -> &GuideParams {
        &self.params
    }
}

impl PosteriorStrategy for RegressivePosterior {
    fn get_posterior(&mut self, site: &SiteContext<'_>) -> Result<Posterior> {
        let transform = site.biject_to_support()?;
        let (loc, scale) = self.get_loc_scale(site, &transform)?;
        let affine = Transform::affine(loc, scale, transform.domain_event_dim());
        let posterior = TransformedDistribution::new(
            site.prior().clone(),
            vec![
                transform.inv().with_cache(),
                affine.with_cache(),
                transform.with_cache(),
            ],
        )?;
        Ok(Posterior::Distribution(posterior.into_dist()))
    }
}

pub type AutoRegressiveMessenger<M> = AutoMessenger<M, RegressivePosterior>;

impl<M> AutoMessenger<M, RegressivePosterior> {
    /// Fails if `config.init_scale` is not a positive finite number.
    pub fn new(model: M, config: AutoGuideConfig) -> Result<Self> {
        build(model, config, RegressivePosterior::new)
    }
}
