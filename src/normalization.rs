//! Local normalization: response normalization across channels and
//! contrast normalization over spatial neighbourhoods.

use ndarray::*;

use crate::{
    convolutions::filter_acts,
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    lit,
    network::Network,
    Activations, Element, Layout, Shape4,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CrossMapNormConfig {
    /// Scale of the sum of squares.
    pub alpha: f64,
    /// Exponent of the denominator.
    pub beta: f64,
    /// Number of channels in a window.
    pub size: usize,
    /// Disjoint windows (channel `c` uses the block of `size` channels
    /// containing it) instead of windows centered on every channel.
    pub blocked: bool,
}

impl Default for CrossMapNormConfig {
    fn default() -> Self {
        CrossMapNormConfig {
            alpha: 1e-4,
            beta: 0.75,
            size: 5,
            blocked: true,
        }
    }
}

impl CrossMapNormConfig {
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    /// Channels `[start, end)` normalizing `channel`.
    fn window(&self, channel: usize, channels: usize) -> (usize, usize) {
        let start = if self.blocked {
            channel / self.size * self.size
        } else {
            channel.saturating_sub(self.size / 2)
        };
        let end = if self.blocked {
            start + self.size
        } else {
            channel + self.size - self.size / 2
        };
        (start, end.min(channels))
    }
}

/// Divides every activation by `(1 + alpha * sum(x^2))^beta`, the sum running
/// over a window of neighbouring channels at the same position. Output shape
/// equals input shape and there are no parameters.
#[derive(Debug, Clone)]
pub struct CrossMapNorm {
    input_layer: LayerId,
    input_shape: Shape4,
    config: CrossMapNormConfig,
}

impl CrossMapNorm {
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        config: CrossMapNormConfig,
    ) -> Result<LayerId> {
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                "cross-map norm",
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        if config.size == 0 || config.size > input_shape.0 {
            return Err(Error::config(
                "cross-map norm",
                format!(
                    "window of {} channels does not fit {} channels",
                    config.size, input_shape.0
                ),
            ));
        }
        net.insert(CrossMapNorm {
            input_layer: input,
            input_shape,
            config,
        })
    }
}

impl<F: Element> Layer<F> for CrossMapNorm {
    fn kind(&self) -> &'static str {
        "cross-map norm"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.input_shape.3
    }

    fn output_shape(&self) -> Shape4 {
        self.input_shape
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input =
            net.upstream("cross-map norm", self.input_layer, self.input_shape, pass, input)?;
        Ok(cross_map_norm(input.view(), &self.config))
    }
}

/// Cross-map normalization of c01b activations.
pub fn cross_map_norm<F: Element>(
    input: ArrayView4<F>,
    config: &CrossMapNormConfig,
) -> Activations<F> {
    let channels = input.len_of(Axis(0));
    let squares = input.mapv(|x| x * x);
    let (alpha, beta): (F, F) = (lit(config.alpha), lit(config.beta));
    let mut output = input.to_owned();
    for (c, mut plane) in output.axis_iter_mut(Axis(0)).enumerate() {
        let (start, end) = config.window(c, channels);
        let sums = squares
            .slice(s![start..end, .., .., ..])
            .sum_axis(Axis(0));
        Zip::from(&mut plane)
            .and(&sums)
            .for_each(|x, &sum| *x = *x / (F::one() + alpha * sum).powf(beta));
    }
    output
}

/// Local contrast normalization: subtracts from every activation the mean of
/// its `filter_size` square neighbourhood (over all channels), then divides
/// by the standard deviation of the centered values over the same
/// neighbourhood. Borders are zero padded. Output shape equals input shape.
///
/// A position whose neighbourhood has zero variance also has a zero
/// centered value, and is set to zero.
#[derive(Debug, Clone)]
pub struct LocalContrastNorm {
    input_layer: LayerId,
    input_shape: Shape4,
    filter_size: usize,
}

impl LocalContrastNorm {
    /// Adds a local contrast normalization of `input`. The neighbourhood side
    /// must be odd so the output keeps the input shape.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        filter_size: usize,
    ) -> Result<LayerId> {
        if filter_size % 2 == 0 {
            return Err(Error::config(
                "local contrast norm",
                format!("filter size must be odd, got {}", filter_size),
            ));
        }
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                "local contrast norm",
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        net.insert(LocalContrastNorm {
            input_layer: input,
            input_shape,
            filter_size,
        })
    }
}

impl<F: Element> Layer<F> for LocalContrastNorm {
    fn kind(&self) -> &'static str {
        "local contrast norm"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.input_shape.3
    }

    fn output_shape(&self) -> Shape4 {
        self.input_shape
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input = net.upstream(
            "local contrast norm",
            self.input_layer,
            self.input_shape,
            pass,
            input,
        )?;
        local_contrast_norm(input.view(), self.filter_size)
    }
}

/// Local contrast normalization of c01b activations with an odd
/// `filter_size`. The neighbourhood averages are convolutions with a
/// constant filter.
pub fn local_contrast_norm<F: Element>(
    input: ArrayView4<F>,
    filter_size: usize,
) -> Result<Activations<F>> {
    let (channels, width, height, _) = input.dim();
    let n = channels * filter_size * filter_size;
    let averaging: Array4<F> =
        Array::from_elem((channels, filter_size, filter_size, channels), lit(1.0 / n as f64));
    let pad = filter_size / 2;

    let mean = filter_acts(input, averaging.view(), 1, pad, (width, height))?;
    let mut centered = &input - &mean;
    let squares = centered.mapv(|v| v * v);
    let variance = filter_acts(squares.view(), averaging.view(), 1, pad, (width, height))?;
    Zip::from(&mut centered).and(&variance).for_each(|x, &var| {
        *x = if var > F::zero() {
            *x / var.sqrt()
        } else {
            F::zero()
        }
    });
    Ok(centered)
}
