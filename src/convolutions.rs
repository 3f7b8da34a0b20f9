//! Module that contains classical convolutions, as used f.e. in convolutional neural networks.
//!
//! More can be read here:
//! - <https://towardsdatascience.com/a-comprehensive-guide-to-convolutional-neural-networks-the-eli5-way-3bd2b1164a53?gi=f4a37beea40b>

use ndarray::*;
use rand::RngCore;

use crate::{
    activation::{initial_alpha, Activation},
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    params::{ParamId, ParamOwnership, ParamStore},
    regularization::{check_rate, dropout},
    Activations, BiasMode, Element, Layout, Shape4, FILTER_TILE_WIDTH,
};

/// Construction parameters of a [`Convolution`] (and of a
/// [`CircularConvolution`](crate::CircularConvolution)).
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    /// Number of filters, a multiple of [`FILTER_TILE_WIDTH`].
    pub n_filters: usize,
    /// Filters are square.
    pub filter_size: usize,
    /// Standard deviation of the normal distribution the weights are drawn from.
    pub weights_std: f64,
    pub init_bias_value: f64,
    pub stride: usize,
    pub activation: Activation,
    /// Dropout rate applied to the layer input, in `[0, 1)`.
    pub dropout: f64,
    /// Zero padding added on every side of both spatial axes.
    pub pad: usize,
    pub bias: BiasMode,
    pub trainable: bool,
}

impl ConvConfig {
    pub fn new(n_filters: usize, filter_size: usize, weights_std: f64) -> Self {
        ConvConfig {
            n_filters,
            filter_size,
            weights_std,
            init_bias_value: 0.0,
            stride: 1,
            activation: Activation::Rectify,
            dropout: 0.0,
            pad: 0,
            bias: BiasMode::Tied,
            trainable: true,
        }
    }

    pub fn init_bias(mut self, value: f64) -> Self {
        self.init_bias_value = value;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn dropout(mut self, rate: f64) -> Self {
        self.dropout = rate;
        self
    }

    pub fn pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    pub fn bias(mut self, mode: BiasMode) -> Self {
        self.bias = mode;
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub(crate) fn validate(&self, layer: &'static str) -> Result<()> {
        if self.n_filters == 0 || self.n_filters % FILTER_TILE_WIDTH != 0 {
            return Err(Error::config(
                layer,
                format!(
                    "filter count must be a positive multiple of {}, got {}",
                    FILTER_TILE_WIDTH, self.n_filters
                ),
            ));
        }
        if self.filter_size == 0 {
            return Err(Error::config(layer, "filter size must be positive"));
        }
        if self.stride == 0 {
            return Err(Error::config(layer, "stride must be positive"));
        }
        if !(self.weights_std >= 0.0 && self.weights_std.is_finite()) {
            return Err(Error::config(
                layer,
                format!("weights std must be finite and non-negative, got {}", self.weights_std),
            ));
        }
        check_rate(layer, self.dropout)
    }
}

/// Output size along one spatial axis of a padded, strided convolution.
/// The last window may hang over the padded border, it then reads zeros.
///
/// `ceil((size + 2 * pad - filter_size + stride) / stride)`
pub fn conv_output_size(size: usize, filter_size: usize, stride: usize, pad: usize) -> usize {
    let span = size + 2 * pad + stride;
    if span <= filter_size {
        return 0;
    }
    (span - filter_size + stride - 1) / stride
}

/// Filter, bias and alpha ids of a convolution-like layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvParams {
    pub(crate) weights: ParamId,
    pub(crate) bias: Option<ParamId>,
    pub(crate) alpha: Option<ParamId>,
}

impl ConvParams {
    /// Allocates the tensors of a layer with the given filter shape. Untied
    /// biases cover the `(channels, width, height)` of `bias_extent`.
    pub(crate) fn register<F: Element>(
        net: &mut Network<F>,
        filter_shape: Shape4,
        bias_mode: BiasMode,
        bias_extent: Shape4,
        activation: Activation,
    ) -> Self {
        let (c, w, h, k) = filter_shape;
        let weights = net.register_param(&[c, w, h, k]);
        let bias = match bias_mode {
            BiasMode::None => None,
            BiasMode::Tied => Some(net.register_param(&[bias_extent.0])),
            BiasMode::Untied => {
                Some(net.register_param(&[bias_extent.0, bias_extent.1, bias_extent.2]))
            }
        };
        ConvParams {
            weights,
            bias,
            alpha: Self::register_alpha(net, activation),
        }
    }

    pub(crate) fn register_alpha<F: Element>(
        net: &mut Network<F>,
        activation: Activation,
    ) -> Option<ParamId> {
        if activation.is_parametric() {
            Some(net.register_param(&[]))
        } else {
            None
        }
    }

    pub(crate) fn ids(&self) -> Vec<ParamId> {
        let mut ids = vec![self.weights];
        ids.extend(self.bias);
        ids.extend(self.alpha);
        ids
    }

    pub(crate) fn reset_weights<F: Element>(
        &self,
        params: &mut ParamStore<F>,
        rng: &mut dyn RngCore,
        weights_std: f64,
        init_bias_value: f64,
    ) -> Result<()> {
        params.fill_normal(self.weights, weights_std, rng)?;
        if let Some(bias) = self.bias {
            params.fill(bias, init_bias_value)?;
        }
        Ok(())
    }

    pub(crate) fn reset_alpha<F: Element>(&self, params: &mut ParamStore<F>) -> Result<()> {
        if let Some(alpha) = self.alpha {
            params.get_mut(alpha)?.fill(initial_alpha());
        }
        Ok(())
    }

    pub(crate) fn alpha_value<F: Element>(&self, params: &ParamStore<F>) -> Result<F> {
        match self.alpha {
            Some(alpha) => params.scalar(alpha),
            None => Ok(initial_alpha()),
        }
    }
}

/// Convolution layer running the windowed convolution operator over the
/// output of its predecessor.
/// The weight tensor has dimension (in that order)
/// (input channels, filter width, filter height, output channels).
#[derive(Debug, Clone)]
pub struct Convolution {
    input_layer: LayerId,
    input_shape: Shape4,
    config: ConvConfig,
    filter_shape: Shape4,
    output_shape: Shape4,
    params: ConvParams,
}

impl Convolution {
    /// Adds a convolution over the output of `input` to the network.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        config: ConvConfig,
    ) -> Result<LayerId> {
        config.validate("convolution")?;
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                "convolution",
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        let (n_channels, width, height, mb_size) = input_shape;
        let padded = width.min(height) + 2 * config.pad;
        if padded < config.filter_size {
            return Err(Error::shape(
                "convolution",
                format!(
                    "filter of size {} does not fit a padded input of {}x{}",
                    config.filter_size,
                    width + 2 * config.pad,
                    height + 2 * config.pad
                ),
            ));
        }

        let filter_shape = (n_channels, config.filter_size, config.filter_size, config.n_filters);
        let output_shape = (
            config.n_filters,
            conv_output_size(width, config.filter_size, config.stride, config.pad),
            conv_output_size(height, config.filter_size, config.stride, config.pad),
            mb_size,
        );
        let params = ConvParams::register(
            net,
            filter_shape,
            config.bias,
            output_shape,
            config.activation,
        );
        net.insert(Convolution {
            input_layer: input,
            input_shape,
            config,
            filter_shape,
            output_shape,
            params,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn input_shape(&self) -> Shape4 {
        self.input_shape
    }

    pub fn filter_shape(&self) -> Shape4 {
        self.filter_shape
    }

    pub fn weights(&self) -> ParamId {
        self.params.weights
    }

    pub fn bias(&self) -> Option<ParamId> {
        self.params.bias
    }

    pub(crate) fn conv_params(&self) -> ConvParams {
        self.params
    }

    pub(crate) fn predecessor(&self) -> LayerId {
        self.input_layer
    }

    pub(crate) fn output_dims(&self) -> Shape4 {
        self.output_shape
    }
}

impl<F: Element> Layer<F> for Convolution {
    fn kind(&self) -> &'static str {
        "convolution"
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
        let input = net.upstream("convolution", self.input_layer, self.input_shape, pass, input)?;
        let input = dropout(input, self.config.dropout, pass.mode(), pass.rng());

        let params = net.params();
        let (_, out_w, out_h, _) = self.output_shape;
        let mut conved = filter_acts(
            input.view(),
            params.filters(self.params.weights)?,
            self.config.stride,
            self.config.pad,
            (out_w, out_h),
        )?;
        if let Some(bias) = self.params.bias {
            add_bias(&mut conved, params.view(bias)?, self.config.bias)?;
        }
        let alpha = self.params.alpha_value(params)?;
        Ok(self.config.activation.apply(conved, alpha))
    }

    fn params(&self) -> Vec<ParamId> {
        self.params.ids()
    }

    fn bias_params(&self) -> Vec<ParamId> {
        self.params.bias.into_iter().collect()
    }

    fn trainable(&self) -> bool {
        self.config.trainable
    }

    fn ownership(&self) -> ParamOwnership {
        ParamOwnership::Owns
    }

    fn reset_params(&self, params: &mut ParamStore<F>, rng: &mut dyn RngCore) -> Result<()> {
        self.params.reset_weights(
            params,
            rng,
            self.config.weights_std,
            self.config.init_bias_value,
        )?;
        self.params.reset_alpha(params)
    }

    fn as_convolution(&self) -> Option<&Convolution> {
        Some(self)
    }
}

/// Copies every (channels, filter, filter) window of the image into one row.
///
/// Args:
///   image: padded image, (C, W, H), large enough to hold every window
///   filter_size: side of the square window
///   stride: distance between adjacent windows
///
/// Returns:
///   cols: (out_w * out_h, C * filter_size * filter_size) matrix, rows are
///         ordered with the height position varying fastest
pub(crate) fn im2col<F: Element>(
    image: ArrayView3<F>,
    filter_size: usize,
    stride: usize,
    out_w: usize,
    out_h: usize,
) -> Array2<F> {
    let channels = image.len_of(Axis(0));
    let mut cols: Array2<F> = Array::zeros((out_w * out_h, channels * filter_size * filter_size));
    let mut row = 0_usize;
    for i in 0..out_w {
        for j in 0..out_h {
            let patch = image.slice(s![
                ..,
                i * stride..i * stride + filter_size,
                j * stride..j * stride + filter_size,
            ]);
            cols.row_mut(row)
                .iter_mut()
                .zip(patch.iter())
                .for_each(|(col, &value)| *col = value);
            row += 1;
        }
    }
    cols
}

/// Flattens a (C, W, H, K) filter bank into a (C * W * H, K) matrix whose
/// rows follow the column order produced by [`im2col`].
pub(crate) fn filter_matrix<F: Element>(filters: ArrayView4<F>) -> Result<Array2<F>> {
    let (channels, width, height, n_filters) = filters.dim();
    // iter() walks the logical order, whatever the memory layout of the view
    Ok(Array::from_shape_vec(
        (channels * width * height, n_filters),
        filters.iter().copied().collect(),
    )?)
}

/// Performs a convolution (cross-correlation, filters are not flipped) on a
/// minibatch of images. Every image is flattened with im2col and multiplied
/// with the flattened filter bank.
///
/// Read more here:
/// - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
///
/// Input:
/// -----------------------------------------------
/// - input: activations of shape (C, W, H, B)
/// - filters: weights of shape (C, FW, FH, K), square
/// -----------------------------------------------
/// - stride: the number of pixels between adjacent receptive fields
/// - pad: zeros added on every side of both spatial axes
/// - out_size: (W', H'); windows reaching past the padded input read zeros
///
/// Returns:
/// -----------------------------------------------
/// - out: Output data, of shape (K, W', H', B)
pub fn filter_acts<F: Element>(
    input: ArrayView4<F>,
    filters: ArrayView4<F>,
    stride: usize,
    pad: usize,
    out_size: (usize, usize),
) -> Result<Activations<F>> {
    let (channels, width, height, batch) = input.dim();
    let (filter_channels, filter_size, filter_height, n_filters) = filters.dim();
    if filter_size != filter_height {
        return Err(Error::shape(
            "filter_acts",
            format!("filters must be square, got {}x{}", filter_size, filter_height),
        ));
    }
    if filter_channels != channels {
        return Err(Error::shape(
            "filter_acts",
            format!(
                "filters expect {} channels, input has {}",
                filter_channels, channels
            ),
        ));
    }
    let (out_w, out_h) = out_size;
    let mut output: Activations<F> = Array::zeros((n_filters, out_w, out_h, batch));
    if out_w == 0 || out_h == 0 {
        return Ok(output);
    }

    let padded_w = ((out_w - 1) * stride + filter_size).max(width + pad);
    let padded_h = ((out_h - 1) * stride + filter_size).max(height + pad);
    let mut padded: Array3<F> = Array::zeros((channels, padded_w, padded_h));
    let filter_col = filter_matrix(filters)?;

    for b in 0..batch {
        // the border outside the assigned region stays zero across images
        padded
            .slice_mut(s![.., pad..pad + width, pad..pad + height])
            .assign(&input.index_axis(Axis(3), b));
        let cols = im2col(padded.view(), filter_size, stride, out_w, out_h);
        let conved = cols.dot(&filter_col).into_shape((out_w, out_h, n_filters))?;
        output
            .index_axis_mut(Axis(3), b)
            .assign(&conved.permuted_axes([2, 0, 1]));
    }
    Ok(output)
}

/// Adds a tied `(K,)` or untied `(K, W, H)` bias to `(K, W, H, B)` activations.
pub(crate) fn add_bias<F: Element>(
    x: &mut Activations<F>,
    bias: ArrayViewD<F>,
    mode: BiasMode,
) -> Result<()> {
    let bias = broadcastable_bias(bias, mode)?;
    *x += &bias;
    Ok(())
}

/// Removes a bias added by [`add_bias`].
pub(crate) fn subtract_bias<F: Element>(
    x: &mut Activations<F>,
    bias: ArrayViewD<F>,
    mode: BiasMode,
) -> Result<()> {
    let bias = broadcastable_bias(bias, mode)?;
    *x -= &bias;
    Ok(())
}

// Broadcasting with ndarray starts at the right side of the shape, so the
// missing axes have to be inserted by hand (else it would compare the batch
// size with the bias channels).
fn broadcastable_bias<F: Element>(bias: ArrayViewD<F>, mode: BiasMode) -> Result<ArrayView4<F>> {
    match mode {
        BiasMode::Tied => Ok(bias
            .into_dimensionality::<Ix1>()?
            .insert_axis(Axis(1))
            .insert_axis(Axis(2))
            .insert_axis(Axis(3))),
        BiasMode::Untied => Ok(bias.into_dimensionality::<Ix3>()?.insert_axis(Axis(3))),
        BiasMode::None => Err(Error::config("bias", "layer has no bias")),
    }
}
