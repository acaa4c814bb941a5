//! Record of one model execution.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};

use crate::distributions::DistRef;
use crate::error::{GuideError, Result};
use crate::plates::Plate;

#[derive(Clone, Debug)]
pub struct TraceSite {
    pub name: String,
    /// The model's distribution, already broadcast against `plates`.
    pub prior: DistRef,
    /// The guide-side distribution the value was drawn from. `None` for
    /// observations and point substitutions.
    pub posterior: Option<DistRef>,
    pub value: Tensor,
    pub observed: bool,
    pub plates: Vec<Plate>,
}

impl TraceSite {
    /// Product of `full_size / size` over the site's plates.
    pub fn scale(&self) -> f64 {
        self.plates.iter().map(|p| p.scale()).product()
    }

    pub fn is_latent(&self) -> bool {
        !self.observed
    }
}

/// Sites in execution order, addressable by name.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    sites: Vec<TraceSite>,
    index: HashMap<String, usize>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub(crate) fn push(&mut self, site: TraceSite) -> Result<()> {
        if self.index.contains_key(&site.name) {
            return Err(GuideError::DuplicateSite(site.name));
        }
        self.index.insert(site.name.clone(), self.sites.len());
        self.sites.push(site);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TraceSite> {
        self.index.get(name).map(|&i| &self.sites[i])
    }

    /// Value realized at an already executed site.
    pub fn value(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .map(|s| &s.value)
            .ok_or_else(|| GuideError::UpstreamNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceSite> {
        self.sites.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sites.iter().map(|s| s.name.as_str())
    }

    /// Values of all non-observed sites, keyed by name.
    pub fn latent_values(&self) -> BTreeMap<String, Tensor> {
        self.sites
            .iter()
            .filter(|s| s.is_latent())
            .map(|s| (s.name.clone(), s.value.clone()))
            .collect()
    }

    /// `sum_i scale_i * sum(log p_i(value_i))` over every site under its prior.
    pub fn model_log_prob(&self) -> Result<Tensor> {
        self.scaled_sum(self.sites.iter().map(|s| (s, &s.prior)))
    }

    /// Same sum under the guide-side distributions. Observed and point sites
    /// contribute nothing.
    pub fn guide_log_prob(&self) -> Result<Tensor> {
        self.scaled_sum(
            self.sites
                .iter()
                .filter(|s| s.is_latent())
                .filter_map(|s| s.posterior.as_ref().map(|q| (s, q))),
        )
    }

    fn scaled_sum<'t>(
        &self,
        terms: impl Iterator<Item = (&'t TraceSite, &'t DistRef)>,
    ) -> Result<Tensor> {
        let mut acc: Option<Tensor> = None;
        for (site, dist) in terms {
            let lp = (dist.log_prob(&site.value)?.sum_all()? * site.scale())?;
            acc = Some(match acc {
                Some(a) => (a + lp)?,
                None => lp,
            });
        }
        match acc {
            Some(a) => Ok(a),
            None => {
                let (dtype, device) = self
                    .sites
                    .first()
                    .map(|s| (s.value.dtype(), s.value.device().clone()))
                    .unwrap_or((DType::F32, Device::Cpu));
                Ok(Tensor::zeros((), dtype, &device)?)
            }
        }
    }
}
