//! The two-branch network end to end: analytic kernel, tiled kernel and the
//! empirical estimate of finite networks must agree.

use approx::assert_relative_eq;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use widenet_core::{
    kernel_fn, FanInSum, FanOut, Get, GetTag, KernelOptions, LayerArgs, Nested, Parallel, Serial, Tolerance,
};
use widenet_empirical::{Batched, MonteCarlo};
use widenet_layers::{elementwise, Dense};

fn net() -> Serial {
    Serial::new()
        .then(Dense::new(16).with_std(1.5, 0.1))
        .then(FanOut::new(2))
        .then(
            Parallel::new()
                .with(Dense::new(8).with_std(1.2, 0.2))
                .with(Serial::new().then(elementwise::erf(1.0, 1.0, 0.0)).then(Dense::new(8).with_std(1.0, 0.2))),
        )
        .then(FanInSum)
}

fn inputs() -> Nested<ArrayD<f64>> {
    let mut rng = StdRng::seed_from_u64(7);
    Nested::Leaf(ArrayD::from_shape_simple_fn(IxDyn(&[5, 7]), || rng.sample::<f64, _>(StandardNormal)))
}

fn analytic(get: &Get) -> ArrayD<f64> {
    kernel_fn(&net(), &inputs(), None, get, &KernelOptions::new(), &LayerArgs::default())
        .unwrap()
        .into_array()
        .unwrap()
}

#[test]
fn scenario_kernel_is_symmetric() {
    let nngp = analytic(&Get::One(GetTag::Nngp));
    assert_eq!(nngp.shape(), &[5, 5]);
    for a in 0..5 {
        for b in 0..5 {
            assert_relative_eq!(nngp[[a, b]], nngp[[b, a]], epsilon = 1e-12);
        }
    }
}

#[test]
fn scenario_monte_carlo_matches_analytic() {
    let get = Get::Many(vec![GetTag::Nngp, GetTag::Ntk]);
    let exact = kernel_fn(&net(), &inputs(), None, &get, &KernelOptions::new(), &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();
    let estimate = MonteCarlo::new(net(), 2024, 10_000)
        .kernel(&inputs(), None, &get, &KernelOptions::new(), &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();

    for (tag, (e, x)) in ["nngp", "ntk"].iter().zip(estimate.iter().zip(exact.iter())) {
        let (e, x) = (e.as_array().unwrap(), x.as_array().unwrap());
        let scale = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let tolerance = Tolerance::new(0.05, 0.03 * scale);
        for (a, b) in e.iter().zip(x.iter()) {
            assert!(tolerance.is_close(*a, *b), "{tag}: empirical {a} vs analytic {b}");
        }
    }
}

#[test]
fn scenario_batched_matches_unbatched() {
    let get = Get::Many(vec![GetTag::Nngp, GetTag::Ntk]);
    let whole = kernel_fn(&net(), &inputs(), None, &get, &KernelOptions::new(), &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();
    let tiled = Batched::new(net(), 2)
        .kernel(&inputs(), None, &get, &KernelOptions::new(), &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();
    for (a, b) in whole.iter().zip(tiled.iter()) {
        let (a, b) = (a.as_array().unwrap(), b.as_array().unwrap());
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-12);
        }
    }
}
