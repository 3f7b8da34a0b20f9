//! Convolution that wraps around the width axis, for inputs whose width is
//! periodic (a ring of sensors, an angle). Along the height axis it is a
//! valid convolution.

use ndarray::*;
use rand::RngCore;

use crate::{
    convolutions::{add_bias, filter_acts, ConvConfig, ConvParams},
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    params::{ParamId, ParamOwnership, ParamStore},
    regularization::dropout,
    Activations, Element, Layout, Shape4,
};

#[derive(Debug, Clone)]
pub struct CircularConvolution {
    input_layer: LayerId,
    input_shape: Shape4,
    config: ConvConfig,
    output_shape: Shape4,
    params: ConvParams,
}

impl CircularConvolution {
    /// Adds a circular convolution over the output of `input`.
    ///
    /// The input width must be a multiple of the stride, and the wrapped
    /// columns (`filter_size - stride` of them) must exist in the input.
    /// Zero padding is not supported.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        config: ConvConfig,
    ) -> Result<LayerId> {
        const KIND: &str = "circular convolution";
        config.validate(KIND)?;
        if config.pad != 0 {
            return Err(Error::config(KIND, "zero padding is not supported"));
        }
        let (filter_size, stride) = (config.filter_size, config.stride);
        if filter_size < stride {
            return Err(Error::config(
                KIND,
                format!("filter size {} is smaller than stride {}", filter_size, stride),
            ));
        }
        let predecessor = net.layer(input)?;
        if predecessor.layout() != Layout::C01B {
            return Err(Error::shape(
                KIND,
                format!("input layer {} does not produce c01b activations", input),
            ));
        }
        let input_shape = predecessor.output_shape();
        let (n_channels, width, height, mb_size) = input_shape;
        if width % stride != 0 {
            return Err(Error::config(
                KIND,
                format!("input width {} is not a multiple of stride {}", width, stride),
            ));
        }
        if filter_size - stride > width || height < filter_size {
            return Err(Error::shape(
                KIND,
                format!(
                    "filter of size {} does not fit a {}x{} input",
                    filter_size, width, height
                ),
            ));
        }

        let filter_shape = (n_channels, filter_size, filter_size, config.n_filters);
        let output_shape = (
            config.n_filters,
            width / stride,
            (height - filter_size + stride) / stride,
            mb_size,
        );
        let params =
            ConvParams::register(net, filter_shape, config.bias, output_shape, config.activation);
        net.insert(CircularConvolution {
            input_layer: input,
            input_shape,
            config,
            output_shape,
            params,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn weights(&self) -> ParamId {
        self.params.weights
    }

    pub fn bias(&self) -> Option<ParamId> {
        self.params.bias
    }
}

impl<F: Element> Layer<F> for CircularConvolution {
    fn kind(&self) -> &'static str {
        "circular convolution"
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
            "circular convolution",
            self.input_layer,
            self.input_shape,
            pass,
            input,
        )?;
        let input = dropout(input, self.config.dropout, pass.mode(), pass.rng());
        let wrapped = wrap_width(input.view(), self.config.filter_size - self.config.stride)?;

        let params = net.params();
        let (_, out_w, out_h, _) = self.output_shape;
        let mut conved = filter_acts(
            wrapped.view(),
            params.filters(self.params.weights)?,
            self.config.stride,
            0,
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
}

/// Appends the leading `extra` columns of the width axis after the last one.
pub fn wrap_width<F: Element>(input: ArrayView4<F>, extra: usize) -> Result<Activations<F>> {
    Ok(concatenate(
        Axis(1),
        &[input.view(), input.slice(s![.., ..extra, .., ..])],
    )?)
}
