//! Stochastic pooling (Zeiler & Fergus, 2013).
//!
//! In training mode every pooling window is treated as a categorical
//! distribution with probabilities proportional to its activations, and one
//! element is drawn from it. In inference mode the window is replaced by the
//! probability weighted average `sum(x^2) / sum(x)`. The execution mode thus
//! switches stochastic pooling together with dropout.

use ndarray::*;
use rand::{Rng, RngCore};

use crate::{
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    lit,
    network::Network,
    pooling::{check_window, pool_output_size, window},
    Activations, Element, ExecutionMode, Layout, Shape4,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StochasticPoolConfig {
    /// Side of the square pooling window.
    pub pool_size: usize,
    /// Distance between windows. Without a stride the windows tile the
    /// input exactly; with one they may overlap and the border windows may
    /// be partial, as in max pooling.
    pub stride: Option<usize>,
    /// Added to every sampling weight. A window of zeros then becomes a
    /// uniform draw instead of a division by zero.
    pub epsilon: f64,
}

impl StochasticPoolConfig {
    pub fn new(pool_size: usize) -> Self {
        StochasticPoolConfig {
            pool_size,
            stride: None,
            epsilon: 1e-12,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

#[derive(Debug, Clone)]
pub struct StochasticPooling {
    input_layer: LayerId,
    input_shape: Shape4,
    pool_size: usize,
    stride: usize,
    epsilon: f64,
    output_shape: Shape4,
}

impl StochasticPooling {
    /// Adds a stochastic pooling of `input`. Without a stride both spatial
    /// axes must be exact multiples of the pool size.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        config: StochasticPoolConfig,
    ) -> Result<LayerId> {
        let pool_size = config.pool_size;
        let stride = config.stride.unwrap_or(pool_size);
        check_window("stochastic pooling", pool_size, stride)?;
        if !(config.epsilon >= 0.0 && config.epsilon.is_finite()) {
            return Err(Error::config(
                "stochastic pooling",
                format!("epsilon must be finite and non-negative, got {}", config.epsilon),
            ));
        }
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                "stochastic pooling",
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        let (channels, width, height, batch) = input_shape;
        if config.stride.is_none() && (width % pool_size != 0 || height % pool_size != 0) {
            return Err(Error::config(
                "stochastic pooling",
                format!(
                    "a {}x{} input cannot be tiled by {}x{} windows",
                    width, height, pool_size, pool_size
                ),
            ));
        }
        if width < pool_size || height < pool_size {
            return Err(Error::shape(
                "stochastic pooling",
                format!("pool size {} exceeds the {}x{} input", pool_size, width, height),
            ));
        }
        let output_shape = (
            channels,
            pool_output_size(width, pool_size, stride),
            pool_output_size(height, pool_size, stride),
            batch,
        );
        net.insert(StochasticPooling {
            input_layer: input,
            input_shape,
            pool_size,
            stride,
            epsilon: config.epsilon,
            output_shape,
        })
    }
}

impl<F: Element> Layer<F> for StochasticPooling {
    fn kind(&self) -> &'static str {
        "stochastic pooling"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.output_shape.3
    }

    fn output_shape(&self) -> Shape4 {
        self.output_shape
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input = net.upstream(
            "stochastic pooling",
            self.input_layer,
            self.input_shape,
            pass,
            input,
        )?;
        let (pool_size, stride, epsilon) = (self.pool_size, self.stride, self.epsilon);
        match pass.mode() {
            ExecutionMode::Training => {
                stochastic_pool(input.view(), pool_size, stride, epsilon, pass.rng())
            }
            ExecutionMode::Inference => weighted_pool(input.view(), pool_size, stride, epsilon),
        }
    }
}

/// Sampling weights of one window: negative activations get no mass.
fn weights<F: Element>(
    window: ArrayView2<'_, F>,
    epsilon: F,
) -> impl Iterator<Item = (F, F)> + '_ {
    window
        .into_iter()
        .map(move |&x| (x, x.max(F::zero()) + epsilon))
}

fn pooled_shape<F>(input: &ArrayView4<F>, pool_size: usize, stride: usize) -> Shape4 {
    let (channels, width, height, batch) = input.dim();
    (
        channels,
        pool_output_size(width, pool_size, stride),
        pool_output_size(height, pool_size, stride),
        batch,
    )
}

/// Window `(i, j)` of channel `c` and image `b`, clipped to the input.
fn pool_window<'a, F>(
    input: &'a ArrayView4<F>,
    (c, i, j, b): (usize, usize, usize, usize),
    pool_size: usize,
    stride: usize,
) -> ArrayView2<'a, F> {
    let (_, width, height, _) = input.dim();
    let (x0, x1) = window(i, pool_size, stride, width);
    let (y0, y1) = window(j, pool_size, stride, height);
    input.slice(s![c, x0..x1, y0..y1, b])
}

fn degenerate_window(c: usize, i: usize, j: usize, b: usize) -> Error {
    Error::degenerate(
        "stochastic pooling",
        format!("window ({}, {}, {}, {}) has no probability mass", c, i, j, b),
    )
}

/// Draws one element of every window, with probability proportional to its
/// (clamped, epsilon shifted) activation. The result is always one of the
/// window's input values.
pub fn stochastic_pool<F: Element>(
    input: ArrayView4<F>,
    pool_size: usize,
    stride: usize,
    epsilon: f64,
    rng: &mut dyn RngCore,
) -> Result<Activations<F>> {
    let epsilon: F = lit(epsilon);
    let mut output = Array4::zeros(pooled_shape(&input, pool_size, stride));
    for ((c, i, j, b), out) in output.indexed_iter_mut() {
        let window = pool_window(&input, (c, i, j, b), pool_size, stride);
        let total = weights(window.view(), epsilon).fold(F::zero(), |acc, (_, w)| acc + w);
        if !(total > F::zero()) {
            return Err(degenerate_window(c, i, j, b));
        }
        let target = total * lit(rng.gen::<f64>());
        let mut cumulative = F::zero();
        let mut selected = None;
        for (x, w) in weights(window.view(), epsilon) {
            // zero weight elements can never be selected
            if w > F::zero() {
                selected = Some(x);
                cumulative += w;
                if target < cumulative {
                    break;
                }
            }
        }
        *out = selected.ok_or_else(|| degenerate_window(c, i, j, b))?;
    }
    Ok(output)
}

/// Replaces every window by the average of its elements weighted by their
/// sampling probabilities, `sum(x^2) / sum(x)` for non-negative activations.
/// The epsilon enters the weights only, so the result stays within the range
/// of the window's values.
pub fn weighted_pool<F: Element>(
    input: ArrayView4<F>,
    pool_size: usize,
    stride: usize,
    epsilon: f64,
) -> Result<Activations<F>> {
    let epsilon: F = lit(epsilon);
    let mut output = Array4::zeros(pooled_shape(&input, pool_size, stride));
    for ((c, i, j, b), out) in output.indexed_iter_mut() {
        let window = pool_window(&input, (c, i, j, b), pool_size, stride);
        let (numerator, denominator) = weights(window, epsilon)
            .fold((F::zero(), F::zero()), |(num, den), (x, w)| (num + w * x, den + w));
        if !(denominator > F::zero()) {
            return Err(degenerate_window(c, i, j, b));
        }
        *out = numerator / denominator;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InputLayer;
    use rand::{rngs::StdRng, SeedableRng};

    fn sample_input() -> Array4<f32> {
        Array4::from_shape_fn((2, 4, 6, 2), |(c, x, y, b)| ((c * 5 + x * 3 + y * 7 + b) % 6) as f32)
    }

    #[test]
    fn spatial_axes_must_tile() {
        let mut net = Network::<f32>::seeded(0);
        let input = InputLayer::new(&mut net, (2, 4, 5), 1, Layout::C01B).unwrap();
        let err = StochasticPooling::new(&mut net, input, StochasticPoolConfig::new(2)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn strided_pooling_keeps_partial_windows() {
        let mut net = Network::<f32>::seeded(0);
        let input = InputLayer::new(&mut net, (2, 5, 6), 1, Layout::C01B).unwrap();
        let pool =
            StochasticPooling::new(&mut net, input, StochasticPoolConfig::new(3).stride(2)).unwrap();
        assert_eq!(net.output_shape(pool).unwrap(), (2, 2, 3, 1));
        let err = StochasticPooling::new(&mut net, input, StochasticPoolConfig::new(2).stride(3))
            .unwrap_err();
        assert!(err.is_configuration());

        // rows of 1..9, the last window holds only the 9
        let input = Array4::from_shape_fn((1, 3, 3, 1), |(_, x, y, _)| (x * 3 + y + 1) as f64);
        let out = weighted_pool(input.view(), 2, 2, 0.0).unwrap();
        assert_eq!(out.dim(), (1, 2, 2, 1));
        assert!((out[[0, 0, 0, 0]] - 46.0 / 12.0).abs() < 1e-12);
        assert_eq!(out[[0, 1, 1, 0]], 9.0);

        let mut rng = StdRng::seed_from_u64(2);
        let drawn = stochastic_pool(input.view(), 2, 2, 0.0, &mut rng).unwrap();
        assert_eq!(drawn[[0, 1, 1, 0]], 9.0);
        let overlapping = stochastic_pool(input.view(), 2, 1, 0.0, &mut rng).unwrap();
        assert_eq!(overlapping.dim(), (1, 2, 2, 1));
        assert!([5.0, 6.0, 8.0, 9.0].contains(&overlapping[[0, 1, 1, 0]]));
    }

    #[test]
    fn weighted_average_of_squares() {
        let input = Array4::from_shape_vec((1, 2, 2, 1), vec![1.0f64, 2.0, 3.0, 0.0]).unwrap();
        let out = weighted_pool(input.view(), 2, 2, 0.0).unwrap();
        // (1 + 4 + 9) / (1 + 2 + 3)
        assert!((out[[0, 0, 0, 0]] - 14.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn zero_window_without_epsilon_is_degenerate() {
        let input = Array4::<f64>::zeros((1, 2, 2, 1));
        assert!(matches!(
            weighted_pool(input.view(), 2, 2, 0.0),
            Err(Error::NumericDegeneracy { .. })
        ));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(stochastic_pool(input.view(), 2, 2, 0.0, &mut rng).is_err());
        // with the default epsilon the window is a uniform draw over zeros
        assert_eq!(weighted_pool(input.view(), 2, 2, 1e-12).unwrap()[[0, 0, 0, 0]], 0.0);
        assert_eq!(stochastic_pool(input.view(), 2, 2, 1e-12, &mut rng).unwrap()[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn inference_is_deterministic() {
        let mut net = Network::<f32>::seeded(0);
        let input = InputLayer::new(&mut net, (2, 4, 6), 2, Layout::C01B).unwrap();
        let pool = StochasticPooling::new(&mut net, input, StochasticPoolConfig::new(2)).unwrap();
        assert_eq!(net.output_shape(pool).unwrap(), (2, 2, 3, 2));

        let data = sample_input();
        let mut rng = StdRng::seed_from_u64(9);
        let mut pass = Pass::new(ExecutionMode::Inference, &mut rng).feed(input, data.view());
        let first = net.output(pool, &mut pass).unwrap();
        let second = net.output(pool, &mut pass).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn training_samples_come_from_the_window() {
        let data = sample_input();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            let out = stochastic_pool(data.view(), 2, 2, 1e-12, &mut rng).unwrap();
            for ((c, i, j, b), &v) in out.indexed_iter() {
                let window = data.slice(s![c, 2 * i..2 * i + 2, 2 * j..2 * j + 2, b]);
                assert!(window.iter().any(|&x| x == v));
            }
        }
    }

    #[test]
    fn zero_activations_are_never_drawn_next_to_positive_ones() {
        let input = Array4::from_shape_vec((1, 2, 2, 1), vec![0.0f32, 0.0, 4.0, 0.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let out = stochastic_pool(input.view(), 2, 2, 0.0, &mut rng).unwrap();
            assert_eq!(out[[0, 0, 0, 0]], 4.0);
        }
    }

    #[test]
    fn training_draws_vary() {
        let data = sample_input();
        let mut rng = StdRng::seed_from_u64(3);
        let draws: Vec<_> = (0..10)
            .map(|_| stochastic_pool(data.view(), 2, 2, 1e-12, &mut rng).unwrap())
            .collect();
        assert!(draws.iter().any(|d| d != &draws[0]));
    }
}
