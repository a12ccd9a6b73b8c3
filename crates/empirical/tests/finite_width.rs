//! Analytic kernels of networks whose layers change the statistics of
//! finite draws (products, dropout, normalization) against the Monte-Carlo
//! estimate of the same networks.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use widenet_core::{
    kernel_fn, FanInProd, FanOut, Get, GetTag, KernelOptions, Layer, LayerArgs, Nested, Parallel, Serial, Tolerance,
};
use widenet_empirical::MonteCarlo;
use widenet_layers::{elementwise, Dense, Dropout, LayerNorm};

fn normal(seed: u64, shape: &[usize]) -> Nested<ArrayD<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    Nested::Leaf(ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample::<f64, _>(StandardNormal)))
}

/// Compare nngp and ntk of `net` with `n_samples` finite draws.
fn assert_agrees<L: Layer>(net: L, x1: &Nested<ArrayD<f64>>, x2: Option<&Nested<ArrayD<f64>>>, n_samples: usize) {
    let get = Get::Many(vec![GetTag::Nngp, GetTag::Ntk]);
    let opts = KernelOptions::new();
    let exact = kernel_fn(&net, x1, x2, &get, &opts, &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();
    let estimate = MonteCarlo::new(net, 31, n_samples)
        .kernel(x1, x2, &get, &opts, &LayerArgs::default())
        .unwrap()
        .into_arrays()
        .unwrap();

    for (tag, (e, x)) in ["nngp", "ntk"].iter().zip(estimate.iter().zip(exact.iter())) {
        let (e, x) = (e.as_array().unwrap(), x.as_array().unwrap());
        assert_eq!(e.shape(), x.shape());
        let scale = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let tolerance = Tolerance::new(0.05, 0.03 * scale);
        for (a, b) in e.iter().zip(x.iter()) {
            assert!(tolerance.is_close(*a, *b), "{tag}: empirical {a} vs analytic {b}");
        }
    }
}

#[test]
fn product_of_non_gaussian_branches() {
    let net = Serial::new()
        .then(FanOut::new(2))
        .then(
            Parallel::new()
                .with(Serial::new().then(Dense::new(16).with_std(1.5, 0.2)).then(elementwise::relu()))
                .with(Serial::new().then(Dense::new(16).with_std(1.2, 0.3)).then(elementwise::erf(1.0, 1.0, 0.0))),
        )
        .then(FanInProd)
        .then(Dense::new(4).with_std(1.0, 0.1));
    assert_agrees(net, &normal(3, &[4, 3]), None, 4000);
}

fn dropout_net() -> Serial {
    Serial::new()
        .then(Dense::new(32).with_std(1.3, 0.1))
        .then(elementwise::relu())
        .then(Dropout::new(0.7))
        .then(Dense::new(4).with_std(1.0, 0.2))
}

#[test]
fn dropout_between_dense_layers() {
    assert_agrees(dropout_net(), &normal(5, &[5, 3]), None, 4000);
}

#[test]
fn dropout_masks_of_two_batches_are_independent() {
    assert_agrees(dropout_net(), &normal(5, &[5, 3]), Some(&normal(6, &[3, 3])), 4000);
}

#[test]
fn layer_norm_before_relu() {
    let net = Serial::new()
        .then(Dense::new(256).with_std(1.5, 0.3))
        .then(LayerNorm::new())
        .then(elementwise::relu())
        .then(Dense::new(4).with_std(1.0, 0.1));
    assert_agrees(net, &normal(8, &[4, 5]), None, 3000);
}
