use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Optimizer;
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::distributions::{Distribution, LogNormal, Normal};
use crate::messenger::{AutoMessenger, PosteriorStrategy};
use crate::params::ParamOwner;
use crate::runtime::{Model, Runtime};
use crate::{AutoGuideConfig, AutoNormalMessenger, AutoRegressiveMessenger, InitLocFn, PlateSpec};

#[derive(Clone, Debug, ValueEnum)]
pub enum GuideType {
    /// Independent transformed Normal per site
    Normal,
    /// Prior pushed through a learned affine map per site
    Regressive,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum InitLoc {
    Mean,
    Feasible,
    Sample,
    Uniform,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(short, long, default_value = "normal")]
    pub guide: GuideType,

    #[arg(long, default_value = "8", help = "Number of groups to simulate")]
    pub groups: usize,

    #[arg(long, help = "Minibatch size over groups")]
    pub subsample: Option<usize>,

    #[arg(long, default_value = "1", help = "Vectorized ELBO particles per step")]
    pub particles: usize,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, default_value = "0.1", help = "Initial posterior scale")]
    pub init_scale: f64,

    #[arg(long, default_value = "mean")]
    pub init_loc: InitLoc,

    #[arg(long, default_value = "2.0", help = "Radius for --init-loc uniform")]
    pub init_radius: f64,

    #[arg(long, help = "Plates whose guide parameters are shared")]
    pub amortized_plate: Vec<String>,

    #[arg(long, default_value = "1.5")]
    pub true_mu: f32,

    #[arg(long, default_value = "0.8")]
    pub true_tau: f32,

    #[arg(short, long, help = "Save guide parameters as safetensors")]
    pub output: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Noisy group-level measurements `y ~ N(theta, sigma)`.
pub struct GroupData {
    pub y: Tensor,
    pub sigma: Tensor,
    pub subsample: Option<usize>,
}

impl GroupData {
    pub fn simulate(ngroups: usize, mu: f32, tau: f32, dev: &Device) -> crate::Result<Self> {
        let theta = Normal::scalar(mu, tau, dev)?.expand(&[ngroups])?.sample()?;
        let sigma = Tensor::rand(0.5f32, 1.5f32, ngroups, dev)?;
        let eps = Tensor::randn(0f32, 1f32, ngroups, dev)?;
        let y = (theta + (eps * &sigma)?)?;
        Ok(Self {
            y,
            sigma,
            subsample: None,
        })
    }

    pub fn num_groups(&self) -> usize {
        self.y.dims()[0]
    }

    pub fn groups_plate(&self) -> PlateSpec {
        let spec = PlateSpec::new("groups", self.num_groups()).dim(-1);
        match self.subsample {
            Some(size) => spec.subsample_size(size),
            None => spec,
        }
    }
}

/// mu ~ N(0, 5), tau ~ LogNormal(0, 1), theta_g ~ N(mu, tau),
/// y_g ~ N(theta_g, sigma_g)
pub fn hierarchical(rt: &mut Runtime<'_>, data: &GroupData) -> crate::Result<()> {
    let dev = data.y.device();
    let mu = rt.sample("mu", Normal::scalar(0.0, 5.0, dev)?)?;
    let tau = rt.sample("tau", LogNormal::scalar(0.0, 1.0, dev)?)?;

    rt.plate(&data.groups_plate(), |rt, groups| {
        let theta = rt.sample("theta", Normal::new(mu, tau)?)?;
        let idx = groups.indices().to_device(dev)?;
        let y = data.y.index_select(&idx, 0)?;
        let sigma = data.sigma.index_select(&idx, 0)?;
        rt.observe("y", Normal::new(theta, sigma)?, &y)?;
        Ok(())
    })
}

fn init_loc_fn(args: &FitArgs) -> InitLocFn {
    match args.init_loc {
        InitLoc::Mean => InitLocFn::default(),
        InitLoc::Feasible => InitLocFn::Feasible,
        InitLoc::Sample => InitLocFn::Sample,
        InitLoc::Uniform => InitLocFn::Uniform {
            radius: args.init_radius,
        },
    }
}

fn train<M, S>(guide: &mut AutoMessenger<M, S>, data: &GroupData, args: &FitArgs) -> Result<()>
where
    M: Model<GroupData>,
    S: PosteriorStrategy + ParamOwner,
{
    let outer = if args.particles > 1 {
        vec![PlateSpec::new("particles", args.particles).dim(-2)]
    } else {
        vec![]
    };

    // materialize every site's parameters before handing them to the optimizer
    guide.trace_in(data, &outer)?;
    let mut adam = candle_nn::AdamW::new_lr(guide.params().all_vars(), args.lr)?;

    info!(
        "Training {} parameter tensors for {} iterations",
        guide.params().all_vars().len(),
        args.iters
    );

    let pb = ProgressBar::new(args.iters as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let nparticles = args.particles.max(1) as f64;
    for i in 0..args.iters {
        let tr = guide.trace_in(data, &outer)?;
        let elbo = ((tr.model_log_prob()? - tr.guide_log_prob()?)? / nparticles)?;
        let loss = elbo.neg()?;
        adam.backward_step(&loss)?;

        if args.verbose && (i % 100 == 0 || i + 1 == args.iters) {
            info!("iter {:4}: loss = {:10.4}", i, loss.to_scalar::<f32>()?);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(())
}

fn report(what: &str, values: &BTreeMap<String, Tensor>) -> Result<()> {
    for (name, v) in values {
        let v: Vec<f32> = v.flatten_all()?.to_vec1()?;
        info!("{} {}: {:?}", what, name, v);
    }
    Ok(())
}

fn save<S: ParamOwner, M>(guide: &AutoMessenger<M, S>, args: &FitArgs) -> Result<()> {
    if let Some(path) = &args.output {
        guide.params().save(path)?;
        info!("Saved guide parameters to {:?}", path);
    }
    Ok(())
}

pub fn run(args: &FitArgs) -> Result<()> {
    let dev = Device::Cpu;

    let mut data = GroupData::simulate(args.groups, args.true_mu, args.true_tau, &dev)?;
    data.subsample = args.subsample;
    info!(
        "Simulated {} groups with mu = {}, tau = {}",
        data.num_groups(),
        args.true_mu,
        args.true_tau
    );

    let config = AutoGuideConfig::default()
        .init_scale(args.init_scale)
        .amortized_plates(args.amortized_plate.iter().cloned())
        .init_loc_fn(init_loc_fn(args));

    match args.guide {
        GuideType::Normal => {
            let mut guide = AutoNormalMessenger::new(hierarchical, config)?;
            train(&mut guide, &data, args)?;
            data.subsample = None;
            report("median", &guide.median(&data)?)?;
            save(&guide, args)?;
        }
        GuideType::Regressive => {
            let mut guide = AutoRegressiveMessenger::new(hierarchical, config)?;
            train(&mut guide, &data, args)?;
            data.subsample = None;
            report("draw", &guide.invoke(&data)?)?;
            save(&guide, args)?;
        }
    }

    info!("Done");
    Ok(())
}
