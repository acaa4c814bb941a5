//! Learnable guide parameters.
//!
//! Each site owns one `(loc, scale)` pair, created on first visit and never
//! re-initialized. Positive parameters are stored as `log` values so that any
//! optimizer step keeps them positive.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use log::debug;

use crate::error::{GuideError, Result};
use crate::plates::{select_subsample, Plate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamConstraint {
    Real,
    Positive,
}

#[derive(Clone, Debug)]
struct Param {
    unconstrained: Var,
    constraint: ParamConstraint,
}

impl Param {
    fn new(init: &Tensor, constraint: ParamConstraint) -> Result<Self> {
        let init = init.detach();
        let unconstrained = match constraint {
            ParamConstraint::Real => init,
            ParamConstraint::Positive => init.log()?,
        };
        Ok(Self {
            unconstrained: Var::from_tensor(&unconstrained)?,
            constraint,
        })
    }

    fn value(&self) -> Result<Tensor> {
        let u = self.unconstrained.as_tensor();
        Ok(match self.constraint {
            ParamConstraint::Real => u.clone(),
            ParamConstraint::Positive => u.exp()?,
        })
    }
}

/// Posterior location and scale of one site, in unconstrained space.
#[derive(Clone, Debug)]
pub struct SiteParams {
    loc: Param,
    scale: Param,
    event_dim: usize,
}

impl SiteParams {
    pub fn loc(&self) -> Result<Tensor> {
        self.loc.value()
    }

    /// Always positive.
    pub fn scale(&self) -> Result<Tensor> {
        self.scale.value()
    }

    pub fn event_dim(&self) -> usize {
        self.event_dim
    }

    /// `(loc, scale)` indexed by the currently subsampled plates.
    pub fn select(&self, plates: &[Plate]) -> Result<(Tensor, Tensor)> {
        Ok((
            select_subsample(&self.loc()?, self.event_dim, plates)?,
            select_subsample(&self.scale()?, self.event_dim, plates)?,
        ))
    }
}

/// Strategies that own their learnable parameters.
pub trait ParamOwner {
    fn params(&self) -> &GuideParams;
}

/// All parameters owned by one guide.
///
/// Every variable is also registered in a [`VarMap`] under `locs.<site>`,
/// `scales.<site>` (log scale) or its own name, so optimizers can take
/// [`GuideParams::all_vars`] and the whole set can be saved as safetensors.
pub struct GuideParams {
    varmap: VarMap,
    sites: BTreeMap<String, SiteParams>,
    extra: BTreeMap<String, Param>,
}

impl Default for GuideParams {
    fn default() -> Self {
        Self::new()
    }
}

impl GuideParams {
    pub fn new() -> Self {
        Self {
            varmap: VarMap::new(),
            sites: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn contains_site(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    pub fn site(&self, name: &str) -> Result<&SiteParams> {
        self.sites
            .get(name)
            .ok_or_else(|| GuideError::MissingParam(name.to_string()))
    }

    pub fn site_names(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(|s| s.as_str())
    }

    /// Register `(loc, scale)` for `name` unless the site already has them.
    /// The first registration wins.
    pub fn init_site(
        &mut self,
        name: &str,
        init_loc: &Tensor,
        init_scale: &Tensor,
        event_dim: usize,
    ) -> Result<&SiteParams> {
        if !self.sites.contains_key(name) {
            let site = SiteParams {
                loc: Param::new(init_loc, ParamConstraint::Real)?,
                scale: Param::new(init_scale, ParamConstraint::Positive)?,
                event_dim,
            };
            self.register(&format!("locs.{}", name), &site.loc)?;
            self.register(&format!("scales.{}", name), &site.scale)?;
            debug!(
                "created guide parameters for `{}`: shape {:?}, event_dim {}",
                name,
                init_loc.dims(),
                event_dim
            );
            self.sites.insert(name.to_string(), site);
        }
        self.site(name)
    }

    /// A free-standing parameter, created from `init` on first use.
    pub fn param<F>(&mut self, name: &str, init: F, constraint: ParamConstraint) -> Result<Tensor>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if let Some(p) = self.extra.get(name) {
            return p.value();
        }
        let p = Param::new(&init()?, constraint)?;
        self.register(name, &p)?;
        debug!("created parameter `{}` ({:?})", name, constraint);
        let value = p.value()?;
        self.extra.insert(name.to_string(), p);
        Ok(value)
    }

    pub fn get_param(&self, name: &str) -> Result<Tensor> {
        self.extra
            .get(name)
            .ok_or_else(|| GuideError::MissingParam(name.to_string()))?
            .value()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.varmap.save(path)?)
    }

    fn register(&self, key: &str, p: &Param) -> Result<()> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("poisoned parameter map: {}", e)))?;
        data.insert(key.to_string(), p.unconstrained.clone());
        Ok(())
    }
}
