//! Module that contains transposed convolutions (also called deconvolution layers).
//!
//! A deconvolution mirrors a previously built [`Convolution`]: it maps that
//! layer's output shape back to its input shape, running the adjoint of the
//! convolution operator.
//!
//! More can be read here:
//! - <https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers>
//! - <https://ieee.nitk.ac.in/blog/deconv/>
use ndarray::*;
use rand::RngCore;

use crate::{
    activation::Activation,
    convolutions::{filter_matrix, subtract_bias, ConvParams, Convolution},
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    params::{ParamId, ParamOwnership, ParamStore},
    regularization::dropout,
    Activations, BiasMode, Element, Layout, Shape4,
};

/// Whether a deconvolution reuses the tensors of its mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSharing {
    /// Reuse the mirror's weights and bias. Adds no trainable parameters.
    Tied,
    /// Allocate independent weights and bias of the same shapes.
    Untied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeconvConfig {
    pub sharing: WeightSharing,
    /// Overrides the mirror's nonlinearity.
    pub activation: Option<Activation>,
    /// Rescale every output image to the L2 norm of the mirror's input.
    pub normalize_output: bool,
}

impl DeconvConfig {
    pub fn tied() -> Self {
        DeconvConfig {
            sharing: WeightSharing::Tied,
            activation: None,
            normalize_output: false,
        }
    }

    pub fn untied() -> Self {
        DeconvConfig {
            sharing: WeightSharing::Untied,
            ..Self::tied()
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize_output = true;
        self
    }
}

/// Inverse of a [`Convolution`]. Filter shape, stride, padding, dropout and
/// bias mode are inherited from the mirror.
#[derive(Debug, Clone)]
pub struct Deconvolution {
    input_layer: LayerId,
    input_shape: Shape4,
    mirror: LayerId,
    mirror_input: LayerId,
    stride: usize,
    pad: usize,
    dropout: f64,
    bias_mode: BiasMode,
    weights_std: f64,
    init_bias_value: f64,
    activation: Activation,
    normalize_output: bool,
    output_shape: Shape4,
    params: ConvParams,
    ownership: ParamOwnership,
}

impl Deconvolution {
    /// Adds a deconvolution of `input` mirroring the convolution `mirror`.
    /// `input` must produce activations of the mirror's output shape.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        mirror: LayerId,
        config: DeconvConfig,
    ) -> Result<LayerId> {
        let conv = net.convolution(mirror)?.clone();
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                "deconvolution",
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        let mirror_output = conv.output_dims();
        if input_shape != mirror_output {
            return Err(Error::shape(
                "deconvolution",
                format!(
                    "input shape {:?} does not match the output shape {:?} of mirror {}",
                    input_shape, mirror_output, mirror
                ),
            ));
        }
        let output_shape = conv.input_shape();
        let conv_config = conv.config();
        let activation = config.activation.unwrap_or(conv_config.activation);

        let (params, ownership) = match config.sharing {
            WeightSharing::Tied => {
                let shared = conv.conv_params();
                let params = ConvParams {
                    weights: shared.weights,
                    bias: shared.bias,
                    alpha: ConvParams::register_alpha(net, activation),
                };
                (params, ParamOwnership::Borrows(mirror))
            }
            WeightSharing::Untied => {
                let params = ConvParams::register(
                    net,
                    conv.filter_shape(),
                    conv_config.bias,
                    mirror_output,
                    activation,
                );
                (params, ParamOwnership::Owns)
            }
        };

        net.insert(Deconvolution {
            input_layer: input,
            input_shape,
            mirror,
            mirror_input: conv.predecessor(),
            stride: conv_config.stride,
            pad: conv_config.pad,
            dropout: conv_config.dropout,
            bias_mode: conv_config.bias,
            weights_std: conv_config.weights_std,
            init_bias_value: conv_config.init_bias_value,
            activation,
            normalize_output: config.normalize_output,
            output_shape,
            params,
            ownership,
        })
    }

    pub fn mirror(&self) -> LayerId {
        self.mirror
    }

    pub fn weights(&self) -> ParamId {
        self.params.weights
    }

    pub fn bias(&self) -> Option<ParamId> {
        self.params.bias
    }

    fn owns_weights(&self) -> bool {
        self.ownership == ParamOwnership::Owns
    }
}

impl<F: Element> Layer<F> for Deconvolution {
    fn kind(&self) -> &'static str {
        "deconvolution"
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
        let mut input =
            net.upstream("deconvolution", self.input_layer, self.input_shape, pass, input)?;
        let params = net.params();
        // undo the bias before undoing the convolution
        if let Some(bias) = self.params.bias {
            subtract_bias(&mut input, params.view(bias)?, self.bias_mode)?;
        }
        let input = dropout(input, self.dropout, pass.mode(), pass.rng());

        let target = if self.stride == 1 {
            None
        } else {
            Some((self.output_shape.1, self.output_shape.2))
        };
        let deconved = image_acts(
            input.view(),
            params.filters(self.params.weights)?,
            self.stride,
            self.pad,
            target,
        )?;
        let alpha = self.params.alpha_value(params)?;
        let out = self.activation.apply(deconved, alpha);

        if self.normalize_output {
            let reference = net.output(self.mirror_input, pass)?;
            match_norms(out, reference.view())
        } else {
            Ok(out)
        }
    }

    fn params(&self) -> Vec<ParamId> {
        if self.owns_weights() {
            self.params.ids()
        } else {
            Vec::new()
        }
    }

    fn bias_params(&self) -> Vec<ParamId> {
        self.params.bias.into_iter().collect()
    }

    fn trainable(&self) -> bool {
        self.owns_weights()
    }

    fn ownership(&self) -> ParamOwnership {
        self.ownership
    }

    fn reset_params(&self, params: &mut ParamStore<F>, rng: &mut dyn RngCore) -> Result<()> {
        if self.owns_weights() {
            self.params
                .reset_weights(params, rng, self.weights_std, self.init_bias_value)?;
        }
        self.params.reset_alpha(params)
    }
}

/// Scales every image of `out` so that its L2 norm over (C, W, H) equals the
/// norm of the matching image of `reference`. An all-zero output image cannot
/// be rescaled and is reported as [`Error::NumericDegeneracy`].
pub fn match_norms<F: Element>(
    mut out: Activations<F>,
    reference: ArrayView4<F>,
) -> Result<Activations<F>> {
    if out.dim() != reference.dim() {
        return Err(Error::shape(
            "deconvolution",
            format!(
                "output of shape {:?} cannot be matched to a reference of shape {:?}",
                out.dim(),
                reference.dim()
            ),
        ));
    }
    for (b, mut image) in out.axis_iter_mut(Axis(3)).enumerate() {
        let out_norm = image.fold(F::zero(), |acc, &v| acc + v * v).sqrt();
        let reference_norm = reference
            .index_axis(Axis(3), b)
            .fold(F::zero(), |acc, &v| acc + v * v)
            .sqrt();
        if out_norm == F::zero() {
            return Err(Error::degenerate(
                "deconvolution",
                format!("output image {} has zero norm and cannot be rescaled", b),
            ));
        }
        let scale = reference_norm / out_norm;
        image.mapv_inplace(|v| v * scale);
    }
    Ok(out)
}

/// Scatters every row of `cols` back into its (C, filter, filter) window,
/// summing where windows overlap. Inverse bookkeeping of `im2col`.
pub(crate) fn col2im<F: Element>(
    cols: ArrayView2<F>,
    channels: usize,
    filter_size: usize,
    stride: usize,
    (out_w, out_h): (usize, usize),
    (image_w, image_h): (usize, usize),
) -> Result<Array3<F>> {
    let mut image: Array3<F> = Array::zeros((channels, image_w, image_h));
    let mut row = 0_usize;
    for i in 0..out_w {
        for j in 0..out_h {
            let patch = cols
                .row(row)
                .into_shape((channels, filter_size, filter_size))?;
            let mut window = image.slice_mut(s![
                ..,
                i * stride..i * stride + filter_size,
                j * stride..j * stride + filter_size,
            ]);
            window += &patch;
            row += 1;
        }
    }
    Ok(image)
}

/// Performs a transposed convolution on a minibatch: the adjoint of
/// [`filter_acts`](crate::convolutions::filter_acts) with the same filters,
/// stride and padding. This upsamples the activations.
///
/// Input:
/// -----------------------------------------------
/// - input: activations of shape (K, W', H', B)
/// - filters: weights of shape (C, FW, FH, K), the layout of the forward convolution
/// -----------------------------------------------
/// - stride, pad: those of the forward convolution
/// - target: (W, H) of the result. With a stride of 1 it can be inferred,
///     otherwise several input sizes map to the same output and it is required.
///
/// Returns:
/// -----------------------------------------------
/// - out: Output data, of shape (C, W, H, B)
pub fn image_acts<F: Element>(
    input: ArrayView4<F>,
    filters: ArrayView4<F>,
    stride: usize,
    pad: usize,
    target: Option<(usize, usize)>,
) -> Result<Activations<F>> {
    let (n_filters, out_w, out_h, batch) = input.dim();
    let (channels, filter_size, filter_height, filter_count) = filters.dim();
    if filter_size != filter_height {
        return Err(Error::shape(
            "image_acts",
            format!("filters must be square, got {}x{}", filter_size, filter_height),
        ));
    }
    if filter_count != n_filters {
        return Err(Error::shape(
            "image_acts",
            format!(
                "filters produce {} channels, input has {}",
                filter_count, n_filters
            ),
        ));
    }
    let (width, height) = match target {
        Some(target) => target,
        None if stride == 1 => {
            let infer = |out: usize| (out + filter_size).checked_sub(1 + 2 * pad);
            match (infer(out_w), infer(out_h)) {
                (Some(w), Some(h)) => (w, h),
                _ => {
                    return Err(Error::shape(
                        "image_acts",
                        format!("no input size maps to an output of {}x{}", out_w, out_h),
                    ))
                }
            }
        }
        None => {
            return Err(Error::config(
                "image_acts",
                format!("stride {} needs an explicit target size", stride),
            ))
        }
    };
    let mut output: Activations<F> = Array::zeros((channels, width, height, batch));
    if out_w == 0 || out_h == 0 {
        return Ok(output);
    }

    let padded_w = ((out_w - 1) * stride + filter_size).max(width + pad);
    let padded_h = ((out_h - 1) * stride + filter_size).max(height + pad);
    let filter_col = filter_matrix(filters)?;

    for b in 0..batch {
        // (K, W', H') -> (W' * H', K), rows in im2col order
        let acts = input.index_axis(Axis(3), b).permuted_axes([1, 2, 0]);
        let rows = Array::from_shape_vec((out_w * out_h, n_filters), acts.iter().copied().collect())?;
        let cols = rows.dot(&filter_col.t());
        let padded = col2im(
            cols.view(),
            channels,
            filter_size,
            stride,
            (out_w, out_h),
            (padded_w, padded_h),
        )?;
        output
            .index_axis_mut(Axis(3), b)
            .assign(&padded.slice(s![.., pad..pad + width, pad..pad + height]));
    }
    Ok(output)
}
