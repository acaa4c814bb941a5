//! Mean-field guide: an independent Normal per site in unconstrained space.

use candle_core::Tensor;

use crate::config::AutoGuideConfig;
use crate::distributions::{Independent, IntoDist, Normal, TransformedDistribution};
use crate::error::Result;
use crate::init::InitLocFn;
use crate::messenger::{
    build, AutoMessenger, MedianStrategy, Posterior, PosteriorStrategy, SiteContext,
};
use crate::params::{GuideParams, ParamOwner};
use crate::transforms::Transform;

/// Lazily create `(loc, scale)` for the site, with `loc` produced by
/// `shift` from the canonical unconstrained initial value.
pub(crate) fn ensure_site_params<F>(
    params: &mut GuideParams,
    site: &SiteContext<'_>,
    transform: &Transform,
    init_loc_fn: &InitLocFn,
    init_scale: f64,
    shift: F,
) -> Result<(Tensor, Tensor)>
where
    F: FnOnce(Tensor) -> Result<Tensor>,
{
    if !params.contains_site(site.name()) {
        let canonical = site.init_unconstrained(init_loc_fn, transform)?;
        let loc = shift(canonical)?;
        let scale = (loc.ones_like()? * init_scale)?;
        params.init_site(site.name(), &loc, &scale, transform.domain_event_dim())?;
    }
    params.site(site.name())?.select(site.plates())
}

/// Each site gets `transform(Normal(loc, scale))`, independent of all other
/// sites, where `transform` maps onto the prior's support.
pub struct MeanFieldPosterior {
    params: GuideParams,
    init_loc_fn: InitLocFn,
    init_scale: f64,
}

impl MeanFieldPosterior {
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

    /// `(loc, scale)` for the site at the current minibatch, created on
    /// first visit.
    pub fn get_loc_scale(
        &mut self,
        site: &SiteContext<'_>,
        transform: &Transform,
    ) -> Result<(Tensor, Tensor)> {
        ensure_site_params(
            &mut self.params,
            site,
            transform,
            &self.init_loc_fn,
            self.init_scale,
            Ok,
        )
    }
}

impl ParamOwner for MeanFieldPosterior {
    fn params(&self) -> &GuideParams {
        &self.params
    }
}

impl PosteriorStrategy for MeanFieldPosterior {
    fn get_posterior(&mut self, site: &SiteContext<'_>) -> Result<Posterior> {
        let transform = site.biject_to_support()?;
        let (loc, scale) = self.get_loc_scale(site, &transform)?;
        let base = Independent::new(Normal::new(loc, scale)?, transform.domain_event_dim())?;
        let posterior = TransformedDistribution::new(base, vec![transform.with_cache()])?;
        Ok(Posterior::Distribution(posterior.into_dist()))
    }
}

impl MedianStrategy for MeanFieldPosterior {
    fn get_posterior_median(&mut self, site: &SiteContext<'_>) -> Result<Tensor> {
        let transform = site.biject_to_support()?;
        let (loc, _) = self.get_loc_scale(site, &transform)?;
        transform.forward(&loc)
    }
}

pub type AutoNormalMessenger<M> = AutoMessenger<M, MeanFieldPosterior>;

impl<M> AutoMessenger<M, MeanFieldPosterior> {
    /// Fails if `config.init_scale` is not a positive finite number.
    pub fn new(model: M, config: AutoGuideConfig) -> Result<Self> {
        build(model, config, MeanFieldPosterior::new)
    }
}
