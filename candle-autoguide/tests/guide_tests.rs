use approx::assert_abs_diff_eq;
use candle_autoguide::cli::fit::{hierarchical, GroupData};
use candle_autoguide::distributions::{
    Bernoulli, Distribution, Exponential, IntoDist, LogNormal, Normal, Uniform,
};
use candle_autoguide::transforms::biject_to;
use candle_autoguide::*;
use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;

fn single_site(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    rt.sample("a", Normal::scalar(0.0, 1.0, &Device::Cpu)?)?;
    Ok(())
}

fn chain(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    let dev = Device::Cpu;
    let a = rt.sample("a", Normal::scalar(0.0, 1.0, &dev)?)?;
    rt.sample("b", Normal::new(a, Tensor::new(1f32, &dev)?)?)?;
    Ok(())
}

fn positive_site(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    rt.sample("s", LogNormal::scalar(0.0, 1.0, &Device::Cpu)?)?;
    Ok(())
}

fn subsampled(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    let dev = Device::Cpu;
    rt.plate(&PlateSpec::new("data", 10).subsample_size(3), |rt, _| {
        rt.sample("x", Normal::scalar(0.0, 1.0, &dev)?)
    })?;
    Ok(())
}

fn grouped(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    let dev = Device::Cpu;
    rt.plate(&PlateSpec::new("group", 5), |rt, _| {
        rt.sample("y", Normal::scalar(1.0, 1.0, &dev)?)
    })?;
    Ok(())
}

fn grouped_data(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    let dev = Device::Cpu;
    rt.plate(&PlateSpec::new("group", 5), |rt, _| {
        rt.plate(&PlateSpec::new("data", 3), |rt, _| {
            rt.sample("y", Normal::scalar(1.0, 1.0, &dev)?)
        })
    })?;
    Ok(())
}

#[test]
fn single_site_parameters() -> Result<()> {
    let mut guide = AutoNormalMessenger::new(single_site, AutoGuideConfig::default())?;
    let draw = guide.invoke(&())?;
    assert_eq!(draw.len(), 1);
    assert!(draw["a"].dims().is_empty());

    let site = guide.params().site("a")?;
    assert!(site.loc()?.dims().is_empty());
    let scale = site.scale()?.to_scalar::<f32>()?;
    assert!(scale > 0.0);
    assert_abs_diff_eq!(scale, 0.1, epsilon = 1e-6);
    assert_eq!(site.loc()?.to_scalar::<f32>()?, 0.0);
    Ok(())
}

#[test]
fn parameters_are_created_once() -> Result<()> {
    let mut guide = AutoNormalMessenger::new(chain, AutoGuideConfig::default())?;
    guide.invoke(&())?;
    let before: Vec<(f32, f32)> = ["a", "b"]
        .iter()
        .map(|n| -> Result<(f32, f32)> {
            let s = guide.params().site(n)?;
            Ok((s.loc()?.to_scalar()?, s.scale()?.to_scalar()?))
        })
        .collect::<Result<_>>()?;

    for _ in 0..3 {
        guide.invoke(&())?;
    }
    for (n, (loc, scale)) in ["a", "b"].iter().zip(before) {
        let s = guide.params().site(n)?;
        assert_eq!(s.loc()?.to_scalar::<f32>()?, loc);
        assert_eq!(s.scale()?.to_scalar::<f32>()?, scale);
    }
    assert_eq!(guide.params().all_vars().len(), 4);
    Ok(())
}

#[test]
fn initial_value_round_trips() -> Result<()> {
    let prior = Uniform::new(2.0, 6.0, DType::F32, &Device::Cpu)?.expand(&[4])?;
    let x = InitLocFn::default().init(&InitSite {
        name: "u",
        prior: &prior,
    })?;
    let t = biject_to(&prior.support())?;
    let back: Vec<f32> = t.forward(&t.inverse(&x)?)?.to_vec1()?;
    let x: Vec<f32> = x.to_vec1()?;
    for (a, b) in x.iter().zip(back.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn median_is_deterministic() -> Result<()> {
    let mut guide = AutoNormalMessenger::new(positive_site, AutoGuideConfig::default())?;
    let m1 = guide.median(&())?;
    let m2 = guide.median(&())?;
    let m1 = m1["s"].to_scalar::<f32>()?;
    assert_eq!(m1, m2["s"].to_scalar::<f32>()?);

    let loc = guide.params().site("s")?.loc()?;
    assert_eq!(m1, loc.exp()?.to_scalar::<f32>()?);
    // mean of LogNormal(0, 1)
    assert_abs_diff_eq!(loc.to_scalar::<f32>()?, 0.5, epsilon = 1e-5);
    Ok(())
}

#[test]
fn subsampled_plate_is_stored_at_full_size() -> Result<()> {
    let mut guide = AutoNormalMessenger::new(subsampled, AutoGuideConfig::default())?;
    let draw = guide.invoke(&())?;
    assert_eq!(draw["x"].dims(), &[3]);
    assert_eq!(guide.params().site("x")?.loc()?.dims(), &[10]);

    let tr = guide.trace(&())?;
    let site = tr.get("x").ok_or(GuideError::UpstreamNotFound("x".into()))?;
    assert_abs_diff_eq!(site.scale(), 10.0 / 3.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn amortized_plate_is_collapsed() -> Result<()> {
    let config = AutoGuideConfig::default().amortized_plates(["group"]);
    let mut guide = AutoNormalMessenger::new(grouped, config.clone())?;
    let draw = guide.invoke(&())?;
    assert_eq!(draw["y"].dims(), &[5]);
    assert!(guide.params().site("y")?.loc()?.dims().is_empty());
    assert_abs_diff_eq!(guide.params().site("y")?.loc()?.to_scalar::<f32>()?, 1.0);

    // behind a data plate the shared axis stays as a size-1 axis
    let mut guide = AutoNormalMessenger::new(grouped_data, config)?;
    let draw = guide.invoke(&())?;
    assert_eq!(draw["y"].dims(), &[3, 5]);
    assert_eq!(guide.params().site("y")?.loc()?.dims(), &[3, 1]);
    Ok(())
}

#[test]
fn outer_plates_are_averaged_per_call() -> Result<()> {
    let mut guide = AutoNormalMessenger::new(single_site, AutoGuideConfig::default())?;
    let particles = [PlateSpec::new("particles", 4)];
    let draw = guide.invoke_in(&(), &particles)?;
    assert_eq!(draw["a"].dims(), &[4]);
    assert!(guide.params().site("a")?.loc()?.dims().is_empty());

    let draw = guide.invoke(&())?;
    assert!(draw["a"].dims().is_empty());
    Ok(())
}

#[test]
fn regressive_initialization() -> Result<()> {
    fn shifted(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
        rt.sample("a", Normal::scalar(2.0, 1.0, &Device::Cpu)?)?;
        Ok(())
    }
    let config = AutoGuideConfig::default().init_scale(0.2);
    let mut guide = AutoRegressiveMessenger::new(shifted, config)?;
    guide.invoke(&())?;
    let site = guide.params().site("a")?;
    assert_abs_diff_eq!(site.loc()?.to_scalar::<f32>()?, 1.6, epsilon = 1e-6);
    assert_abs_diff_eq!(site.scale()?.to_scalar::<f32>()?, 0.2, epsilon = 1e-6);
    Ok(())
}

#[test]
fn regressive_posterior_follows_upstream() -> Result<()> {
    let mut guide = AutoRegressiveMessenger::new(chain, AutoGuideConfig::default())?;
    guide.invoke(&())?;
    let (loc, scale) = {
        let s = guide.params().site("b")?;
        (s.loc()?.to_scalar::<f32>()? as f64, s.scale()?.to_scalar::<f32>()? as f64)
    };

    let z = Tensor::new(0.3f32, &Device::Cpu)?;
    let mut seen = vec![];
    for _ in 0..2 {
        let tr = guide.trace(&())?;
        let a = tr.value("a")?.to_scalar::<f32>()? as f64;
        let b = tr.get("b").ok_or(GuideError::UpstreamNotFound("b".into()))?;
        let q = b.posterior.clone().ok_or(GuideError::MissingParam("b".into()))?;

        // prior N(a, 1) pushed through x -> loc + scale * x
        let u = (0.3 - loc) / scale;
        let expected = normal_log_density(u, a, 1.0) - scale.ln();
        let lp = q.log_prob(&z)?.to_scalar::<f32>()? as f64;
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-3);
        seen.push(lp);

        let s = guide.params().site("b")?;
        assert_eq!(s.loc()?.to_scalar::<f32>()? as f64, loc);
        assert_eq!(s.scale()?.to_scalar::<f32>()? as f64, scale);
    }
    assert_ne!(seen[0], seen[1]);
    Ok(())
}

fn normal_log_density(x: f64, loc: f64, scale: f64) -> f64 {
    let z = (x - loc) / scale;
    -0.5 * z * z - scale.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

fn positive_sites(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
    let dev = Device::Cpu;
    rt.sample("a", Exponential::new(Tensor::new(1f32, &dev)?)?)?;
    rt.plate(&PlateSpec::new("g", 6).subsample_size(2), |rt, _| {
        rt.sample("b", LogNormal::scalar(0.5, 1.0, &dev)?)
    })?;
    Ok(())
}

#[test]
fn regressive_density_through_log_bijection() -> Result<()> {
    let config = AutoGuideConfig::default().amortized_plates(["g"]);
    let mut guide = AutoRegressiveMessenger::new(positive_sites, config)?;
    let tr = guide.trace(&())?;

    let site_loc_scale = |name: &str| -> Result<(f64, f64)> {
        let s = guide.params().site(name)?;
        let loc = s.loc()?;
        assert!(loc.dims().is_empty());
        Ok((
            loc.to_scalar::<f32>()? as f64,
            s.scale()?.to_scalar::<f32>()? as f64,
        ))
    };

    // y = exp(loc + scale * log x) for a prior draw x, so with u = (log y - loc) / scale
    // log q(y) = log p(exp(u)) + u - log scale - log y
    let (loc, scale) = site_loc_scale("a")?;
    let ya = tr.value("a")?.to_scalar::<f32>()? as f64;
    assert!(ya > 0.0);
    let u = (ya.ln() - loc) / scale;
    let expected_a = -u.exp() + u - scale.ln() - ya.ln();

    // LogNormal(m, s) in log space is N(m, s)
    let (loc, scale) = site_loc_scale("b")?;
    let yb: Vec<f32> = tr.value("b")?.to_vec1()?;
    assert_eq!(yb.len(), 2);
    let mut expected_b = 0.0;
    for y in yb.iter().map(|&y| y as f64) {
        assert!(y > 0.0);
        let u = (y.ln() - loc) / scale;
        expected_b += normal_log_density(u, 0.5, 1.0) - scale.ln() - y.ln();
    }

    let q_a = tr.get("a").and_then(|s| s.posterior.clone());
    let q_a = q_a.ok_or(GuideError::MissingParam("a".into()))?;
    let lp_a = q_a.log_prob(tr.value("a")?)?.to_scalar::<f32>()? as f64;
    assert_abs_diff_eq!(lp_a, expected_a, epsilon = 1e-3);

    // the plate keeps 2 of 6 groups, so b counts three times
    let total = tr.guide_log_prob()?.to_scalar::<f32>()? as f64;
    assert_abs_diff_eq!(total, expected_a + 3.0 * expected_b, epsilon = 1e-3);
    Ok(())
}

#[test]
fn invalid_init_scale() -> Result<()> {
    for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        let config = AutoGuideConfig::default().init_scale(bad);
        assert!(matches!(
            AutoNormalMessenger::new(single_site, config.clone()),
            Err(GuideError::InvalidInitScale(_))
        ));
        assert!(matches!(
            AutoRegressiveMessenger::new(single_site, config),
            Err(GuideError::InvalidInitScale(_))
        ));
    }
    Ok(())
}

#[test]
fn discrete_site_is_rejected_with_its_name() -> Result<()> {
    fn coin(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
        rt.sample("coin", Bernoulli::new(Tensor::new(0.3f32, &Device::Cpu)?)?)?;
        Ok(())
    }
    let mut guide = AutoNormalMessenger::new(coin, AutoGuideConfig::default())?;
    match guide.invoke(&()) {
        Err(e @ GuideError::UnsupportedSupport { .. }) => {
            let msg = e.to_string();
            assert!(msg.contains("coin"));
            assert!(msg.contains("Bernoulli"));
        }
        other => panic!("expected an unsupported support error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn packed_values_are_ordered_by_name() -> Result<()> {
    fn unordered(rt: &mut Runtime<'_>, _: &()) -> Result<()> {
        let dev = Device::Cpu;
        rt.sample("z", Normal::scalar(0.0, 1.0, &dev)?.expand(&[3])?)?;
        rt.sample("a", Normal::scalar(0.0, 1.0, &dev)?)?;
        rt.sample("m", Normal::scalar(0.0, 1.0, &dev)?.expand(&[2])?)?;
        Ok(())
    }
    let mut guide = AutoNormalMessenger::new(unordered, AutoGuideConfig::default())?;
    let packed = guide.invoke_packed(&())?;
    let dims: Vec<Vec<usize>> = packed.iter().map(|t| t.dims().to_vec()).collect();
    assert_eq!(dims, vec![vec![], vec![2], vec![3]]);
    Ok(())
}

/// Mean-field everywhere except `b`, which is regressed on `a`.
struct LinkedPosterior {
    inner: MeanFieldPosterior,
}

impl PosteriorStrategy for LinkedPosterior {
    fn get_posterior(&mut self, site: &SiteContext<'_>) -> Result<Posterior> {
        if site.name() != "b" {
            return self.inner.get_posterior(site);
        }
        let a = site.upstream_value("a")?;
        let w = self.inner.params_mut().param(
            "b_weight",
            || Ok(Tensor::new(2f32, a.device())?),
            ParamConstraint::Real,
        )?;
        let q = Normal::new(a.broadcast_mul(&w)?, Tensor::new(0.5f32, a.device())?)?;
        Ok(Posterior::Distribution(q.into_dist()))
    }
}

#[test]
fn custom_strategy_overrides_one_site() -> Result<()> {
    let strategy = LinkedPosterior {
        inner: MeanFieldPosterior::new(InitLocFn::default(), 0.1),
    };
    let mut guide = AutoMessenger::with_strategy(chain, strategy, vec![]);
    let tr = guide.trace(&())?;

    let inner = guide.strategy().inner.params();
    assert!(inner.contains_site("a"));
    assert!(!inner.contains_site("b"));
    assert_eq!(inner.get_param("b_weight")?.to_scalar::<f32>()?, 2.0);
    assert!(tr.get("b").and_then(|s| s.posterior.as_ref()).is_some());
    assert_eq!(inner.all_vars().len(), 3);
    Ok(())
}

/// Asks for a site the model has not reached yet.
struct Lookahead;

impl PosteriorStrategy for Lookahead {
    fn get_posterior(&mut self, site: &SiteContext<'_>) -> Result<Posterior> {
        let later = site.upstream_value("b")?;
        Ok(Posterior::Value(later))
    }
}

#[test]
fn upstream_lookup_of_a_later_site_fails() -> Result<()> {
    let mut guide = AutoMessenger::with_strategy(chain, Lookahead, vec![]);
    assert!(matches!(
        guide.invoke(&()),
        Err(GuideError::UpstreamNotFound(name)) if name == "b"
    ));
    Ok(())
}

#[test]
fn elbo_steps_on_the_hierarchical_model() -> Result<()> {
    let dev = Device::Cpu;
    let mut data = GroupData::simulate(8, 1.5, 0.8, &dev)?;
    data.subsample = Some(4);

    let mut guide = AutoNormalMessenger::new(hierarchical, AutoGuideConfig::default())?;
    guide.trace(&data)?;
    assert_eq!(guide.params().site("theta")?.loc()?.dims(), &[8]);

    let mut adam = candle_nn::AdamW::new_lr(guide.params().all_vars(), 0.01)?;
    for _ in 0..5 {
        let tr = guide.trace(&data)?;
        let loss = (tr.guide_log_prob()? - tr.model_log_prob()?)?;
        assert!(loss.to_scalar::<f32>()?.is_finite());
        adam.backward_step(&loss)?;
    }

    data.subsample = None;
    let median = guide.median(&data)?;
    assert_eq!(median["theta"].dims(), &[8]);
    assert!(median["tau"].to_scalar::<f32>()? > 0.0);
    Ok(())
}

#[test]
fn prior_handler_simulates() -> Result<()> {
    let tr = runtime::trace_model(&chain, &(), &mut PriorHandler, &[])?;
    assert_eq!(tr.names().collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(tr.get("b").map(|s| s.posterior.is_none()).unwrap_or(false));
    assert!(tr.model_log_prob()?.to_scalar::<f32>()?.is_finite());
    Ok(())
}
