use convnet_layers::{
    convolutions::filter_acts, transposed_convolutions::image_acts, Activation, BiasMode,
    ConvConfig, Convolution, CrossMapNorm, CrossMapNormConfig, DeconvConfig, Deconvolution,
    ExecutionMode, InputLayer, Layout, MaxPooling, Network, ParamOwnership, Pass,
    StochasticPoolConfig, StochasticPooling, Unpooling,
};
use ndarray::{arr0, Array4, Axis};
use rand::{rngs::StdRng, SeedableRng};

fn sample_batch(shape: (usize, usize, usize, usize)) -> Array4<f64> {
    Array4::from_shape_fn(shape, |(c, x, y, b)| ((c * 7 + x * 3 + y * 5 + b) % 11) as f64 / 10.0)
}

#[test]
fn tied_deconvolution_sees_updates_of_the_mirror_weights() {
    let mut net = Network::<f64>::seeded(1);
    let input = InputLayer::new(&mut net, (2, 6, 6), 1, Layout::C01B).unwrap();
    let conv = Convolution::new(
        &mut net,
        input,
        ConvConfig::new(16, 3, 0.1)
            .bias(BiasMode::None)
            .activation(Activation::Identity),
    )
    .unwrap();
    let deconv = Deconvolution::new(&mut net, conv, conv, DeconvConfig::tied()).unwrap();

    assert_eq!(net.ownership(deconv).unwrap(), ParamOwnership::Borrows(conv));
    assert!(net.layer(deconv).unwrap().params().is_empty());
    assert_eq!(net.trainable_params(), net.layer(conv).unwrap().params());

    let weights = net.layer(conv).unwrap().params()[0];
    let filters = Array4::from_shape_fn((2, 3, 3, 16), |(c, x, y, k)| {
        ((c + x * 2 + y * 3 + k) % 4) as f64 - 1.5
    });
    net.params_mut().set(weights, filters.clone().into_dyn()).unwrap();

    let data = sample_batch((2, 6, 6, 1));
    let mut rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(ExecutionMode::Inference, &mut rng).feed(input, data.view());
    let reconstruction = net.output(deconv, &mut pass).unwrap();

    let code = filter_acts(data.view(), filters.view(), 1, 0, (4, 4)).unwrap();
    let expected = image_acts(code.view(), filters.view(), 1, 0, None).unwrap();
    assert_eq!(reconstruction, expected);
}

#[test]
fn untied_deconvolution_owns_independent_tensors() {
    let mut net = Network::<f32>::seeded(2);
    let input = InputLayer::new(&mut net, (3, 8, 8), 2, Layout::C01B).unwrap();
    let conv = Convolution::new(&mut net, input, ConvConfig::new(16, 3, 0.1)).unwrap();
    let deconv = Deconvolution::new(&mut net, conv, conv, DeconvConfig::untied()).unwrap();
    assert_eq!(net.ownership(deconv).unwrap(), ParamOwnership::Owns);

    let conv_params = net.layer(conv).unwrap().params();
    let deconv_params = net.layer(deconv).unwrap().params();
    assert_eq!(conv_params.len(), deconv_params.len());
    for (mine, theirs) in conv_params.iter().zip(&deconv_params) {
        assert_ne!(mine, theirs);
        assert_eq!(
            net.params().get(*mine).unwrap().shape(),
            net.params().get(*theirs).unwrap().shape()
        );
    }

    let before = net.params().get(deconv_params[0]).unwrap().clone();
    net.params_mut().get_mut(conv_params[0]).unwrap().fill(3.0);
    assert_eq!(net.params().get(deconv_params[0]).unwrap(), &before);
    assert_eq!(net.trainable_params().len(), 4);
    assert_eq!(net.bias_params().len(), 2);
}

#[test]
fn untied_deconvolution_uses_its_own_weights_and_untied_bias() {
    let mut net = Network::<f64>::seeded(9);
    let input = InputLayer::new(&mut net, (2, 6, 6), 1, Layout::C01B).unwrap();
    let conv = Convolution::new(
        &mut net,
        input,
        ConvConfig::new(16, 3, 0.1)
            .bias(BiasMode::Untied)
            .activation(Activation::Identity),
    )
    .unwrap();
    let deconv = Deconvolution::new(&mut net, conv, conv, DeconvConfig::untied()).unwrap();
    let ids = net.layer(deconv).unwrap().params();
    assert_eq!(ids.len(), 2);
    assert_eq!(net.params().get(ids[1]).unwrap().shape(), &[16, 4, 4]);

    let filters = Array4::from_shape_fn((2, 3, 3, 16), |(c, x, y, k)| {
        ((c * 3 + x + y * 2 + k) % 5) as f64 - 2.0
    });
    let bias = Array4::from_shape_fn((16, 4, 4, 1), |(k, x, y, _)| ((k + x + 2 * y) % 3) as f64);
    net.params_mut().set(ids[0], filters.clone().into_dyn()).unwrap();
    net.params_mut()
        .set(ids[1], bias.index_axis(Axis(3), 0).to_owned().into_dyn())
        .unwrap();

    let code = Array4::from_shape_fn((16, 4, 4, 1), |(k, x, y, _)| ((k * 2 + x * 3 + y) % 7) as f64);
    let mut rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(ExecutionMode::Inference, &mut rng);
    let out = net.output_from(deconv, &mut pass, code.clone()).unwrap();

    let expected = image_acts((&code - &bias).view(), filters.view(), 1, 0, None).unwrap();
    assert_eq!(out, expected);
}

#[test]
fn tied_parametric_deconvolution_owns_an_untrained_alpha() {
    let mut net = Network::<f64>::seeded(10);
    let input = InputLayer::new(&mut net, (2, 6, 6), 1, Layout::C01B).unwrap();
    let conv = Convolution::new(
        &mut net,
        input,
        ConvConfig::new(16, 3, 0.1)
            .bias(BiasMode::None)
            .activation(Activation::Identity),
    )
    .unwrap();
    let before = net.params().len();
    let deconv = Deconvolution::new(
        &mut net,
        conv,
        conv,
        DeconvConfig::tied().activation(Activation::ParametricRectify),
    )
    .unwrap();
    assert_eq!(net.params().len(), before + 1);
    let alpha = net.params().ids().last().unwrap();
    assert_eq!(net.params().get(alpha).unwrap().ndim(), 0);
    assert!(net.params().get(alpha).unwrap().iter().all(|&a| a == 0.0));
    assert!(!net.trainable_params().contains(&alpha));
    assert_eq!(net.ownership(deconv).unwrap(), ParamOwnership::Borrows(conv));

    net.params_mut().set(alpha, arr0(0.5).into_dyn()).unwrap();
    let weights = net.layer(conv).unwrap().params()[0];
    let filters: Array4<f64> = net
        .params()
        .get(weights)
        .unwrap()
        .clone()
        .into_dimensionality()
        .unwrap();
    let code = Array4::from_shape_fn((16, 4, 4, 1), |(k, x, y, _)| ((k + x * 5 + y) % 9) as f64 - 4.0);
    let mut rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(ExecutionMode::Inference, &mut rng);
    let out = net.output_from(deconv, &mut pass, code.clone()).unwrap();

    let deconved = image_acts(code.view(), filters.view(), 1, 0, None).unwrap();
    assert_eq!(out, Activation::ParametricRectify.apply(deconved, 0.5));
}

#[test]
fn normalized_deconvolution_matches_norms_during_training() {
    let mut net = Network::<f64>::seeded(11);
    let input = InputLayer::new(&mut net, (2, 6, 6), 2, Layout::C01B).unwrap();
    let conv = Convolution::new(
        &mut net,
        input,
        ConvConfig::new(16, 3, 0.5)
            .bias(BiasMode::None)
            .activation(Activation::Identity)
            .dropout(0.5),
    )
    .unwrap();
    let deconv =
        Deconvolution::new(&mut net, conv, conv, DeconvConfig::tied().normalized()).unwrap();

    let data = sample_batch((2, 6, 6, 2));
    let mut rng = StdRng::seed_from_u64(12);
    let mut pass = Pass::new(ExecutionMode::Training, &mut rng).feed(input, data.view());
    let out = net.output(deconv, &mut pass).unwrap();
    let norm = |a: ndarray::ArrayView3<f64>| a.iter().map(|v| v * v).sum::<f64>().sqrt();
    for b in 0..2 {
        let expected = norm(data.index_axis(Axis(3), b));
        assert!((norm(out.index_axis(Axis(3), b)) - expected).abs() < 1e-9);
    }
}

#[test]
fn convolutional_autoencoder_reconstructs_the_input_shape() {
    let mut net = Network::<f64>::seeded(3);
    let input = InputLayer::new(&mut net, (3, 8, 8), 2, Layout::C01B).unwrap();
    let conv1 = Convolution::new(&mut net, input, ConvConfig::new(16, 3, 0.05).pad(1)).unwrap();
    let pool = MaxPooling::new(&mut net, conv1, 2, None).unwrap();
    let conv2 = Convolution::new(
        &mut net,
        pool,
        ConvConfig::new(32, 3, 0.05).pad(1).dropout(0.5),
    )
    .unwrap();
    let deconv2 = Deconvolution::new(&mut net, conv2, conv2, DeconvConfig::tied()).unwrap();
    let unpool = Unpooling::new(&mut net, deconv2, pool).unwrap();
    let deconv1 = Deconvolution::new(
        &mut net,
        unpool,
        conv1,
        DeconvConfig::tied().activation(Activation::Sigmoid),
    )
    .unwrap();

    assert_eq!(net.output_shape(pool).unwrap(), (16, 4, 4, 2));
    assert_eq!(net.output_shape(deconv2).unwrap(), (16, 4, 4, 2));
    assert_eq!(net.output_shape(unpool).unwrap(), (16, 8, 8, 2));
    assert_eq!(net.output_shape(deconv1).unwrap(), (3, 8, 8, 2));
    assert_eq!(net.layer(deconv1).unwrap().mb_size(), 2);
    assert_eq!(net.trainable_params().len(), 4);
    assert_eq!(net.bias_params().len(), 2);

    let data = sample_batch((3, 8, 8, 2));
    for &mode in &[ExecutionMode::Training, ExecutionMode::Inference] {
        let mut rng = StdRng::seed_from_u64(4);
        let mut pass = Pass::new(mode, &mut rng).feed(input, data.view());
        let out = net.output(deconv1, &mut pass).unwrap();
        assert_eq!(out.dim(), (3, 8, 8, 2));
        assert!(out.iter().all(|v| v.is_finite() && *v > 0.0 && *v < 1.0));
    }
}

#[test]
fn inference_ignores_the_seed_and_training_follows_it() {
    let mut net = Network::<f32>::seeded(5);
    let input = InputLayer::new(&mut net, (16, 8, 8), 1, Layout::C01B).unwrap();
    let norm = CrossMapNorm::new(&mut net, input, CrossMapNormConfig::default()).unwrap();
    let conv = Convolution::new(&mut net, norm, ConvConfig::new(16, 3, 0.1).dropout(0.3)).unwrap();
    let pool = StochasticPooling::new(&mut net, conv, StochasticPoolConfig::new(2)).unwrap();
    assert_eq!(net.output_shape(pool).unwrap(), (16, 3, 3, 1));

    let data = Array4::from_shape_fn((16, 8, 8, 1), |(c, x, y, _)| ((c + x * y) % 7) as f32);
    let run = |mode, seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pass = Pass::new(mode, &mut rng).feed(input, data.view());
        net.output(pool, &mut pass).unwrap()
    };
    assert_eq!(run(ExecutionMode::Inference, 0), run(ExecutionMode::Inference, 1));
    assert_eq!(run(ExecutionMode::Training, 9), run(ExecutionMode::Training, 9));
}

#[test]
fn reset_redraws_owned_parameters_only() {
    let mut net = Network::<f32>::seeded(6);
    let input = InputLayer::new(&mut net, (3, 8, 8), 1, Layout::C01B).unwrap();
    let conv = Convolution::new(&mut net, input, ConvConfig::new(16, 3, 0.1).init_bias(0.2)).unwrap();
    let deconv = Deconvolution::new(&mut net, conv, conv, DeconvConfig::tied()).unwrap();
    let ids = net.layer(conv).unwrap().params();

    let weights_before = net.params().get(ids[0]).unwrap().clone();
    net.params_mut().get_mut(ids[1]).unwrap().fill(5.0);
    net.reset_params().unwrap();

    assert_ne!(net.params().get(ids[0]).unwrap(), &weights_before);
    assert!(net.params().get(ids[1]).unwrap().iter().all(|&b| b == 0.2));
    assert_eq!(net.ownership(deconv).unwrap(), ParamOwnership::Borrows(conv));
    assert_eq!(net.params().get(ids[0]).unwrap().shape(), &[3, 3, 3, 16]);
}

#[test]
fn parameters_survive_an_npy_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut net = Network::<f64>::seeded(8);
    let input = InputLayer::new(&mut net, (3, 8, 8), 1, Layout::C01B).unwrap();
    Convolution::new(&mut net, input, ConvConfig::new(16, 3, 0.1)).unwrap();
    let ids = net.trainable_params();
    net.params().save_npy(dir.path(), &ids).unwrap();

    let saved = net.params().clone();
    net.reset_params().unwrap();
    assert_ne!(net.params().get(ids[0]).unwrap(), saved.get(ids[0]).unwrap());
    net.params_mut().load_npy(dir.path(), &ids).unwrap();
    for id in ids {
        assert_eq!(net.params().get(id).unwrap(), saved.get(id).unwrap());
    }
}
