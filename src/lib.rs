//! This package builds convolutional networks as a graph of composable layers.
//! Every layer knows its output shape before any data flows, and computes its
//! activation by pulling the activation of its predecessor.
//!
//! Besides the usual forward operators (convolution, max and stochastic
//! pooling, cross-map and local contrast normalization, circular convolution)
//! we provide their inverses (deconvolution, unpooling) which mirror a
//! previously built forward layer, optionally sharing its weights. This is
//! what autoencoder-style architectures need.
//!
//! All activations use the `(channels, width, height, batch)` layout and all
//! filters the `(in channels, width, height, out channels)` layout. The
//! windowed operators are implemented with the im2col technique:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
//!
//! Example:
//! ```
//! use convnet_layers::*;
//! use ndarray::Array4;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut net = Network::<f32>::seeded(0);
//! let input = InputLayer::new(&mut net, (3, 8, 8), 2, Layout::C01B).unwrap();
//! let conv = Convolution::new(&mut net, input, ConvConfig::new(16, 3, 0.01).pad(1)).unwrap();
//! let deconv = Deconvolution::new(&mut net, conv, conv, DeconvConfig::tied()).unwrap();
//!
//! // The decoder reproduces the shape of the encoder's input.
//! assert_eq!(net.output_shape(deconv).unwrap(), (3, 8, 8, 2));
//!
//! let data = Array4::<f32>::ones((3, 8, 8, 2));
//! let mut rng = StdRng::seed_from_u64(1);
//! let mut pass = Pass::new(ExecutionMode::Inference, &mut rng).feed(input, data.view());
//! let reconstruction = net.output(deconv, &mut pass).unwrap();
//! println!("Reconstruction: {:?}", reconstruction);
//! ```

use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign, SubAssign};

use ndarray::{Array4, ScalarOperand};
use num_traits::Float;

pub mod activation;
pub mod circular;
pub mod convolutions;
pub mod error;
pub mod input;
pub mod layer;
pub mod layout;
pub mod network;
pub mod normalization;
pub mod params;
pub mod pooling;
pub mod regularization;
pub mod stochastic_pooling;
pub mod transposed_convolutions;

/// Shape of a 4D tensor, in the layout of the layer that produced it.
pub type Shape4 = (usize, usize, usize, usize);
/// Activations in `(channels, width, height, batch)` layout.
pub type Activations<F> = Array4<F>;

/// The windowed operator backend processes filters in tiles of this width,
/// so the filter count of every convolution must be a multiple of it.
pub const FILTER_TILE_WIDTH: usize = 16;

/// Scalar types the layers can compute with (`f32` and `f64`).
pub trait Element:
    'static + Float + AddAssign + SubAssign + MulAssign + ScalarOperand + Debug
{
}

impl<T> Element for T where
    T: 'static + Float + AddAssign + SubAssign + MulAssign + ScalarOperand + Debug
{
}

/// Converts a configuration constant to the element type.
pub(crate) fn lit<F: Float>(value: f64) -> F {
    F::from(value).unwrap_or_else(F::nan)
}

/// How a convolution adds its bias.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum BiasMode {
    /// No bias at all.
    None,
    /// One bias per output channel, shared by every position.
    Tied,
    /// One bias per output channel and spatial position.
    Untied,
}

/// Axis order of a 4D activation tensor.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Layout {
    /// `(channels, width, height, batch)`, used by the windowed operators.
    C01B,
    /// `(batch, channels, width, height)`.
    BC01,
}

impl Layout {
    /// Permutation taking a tensor in this layout to c01b.
    pub(crate) fn to_c01b_axes(self) -> [usize; 4] {
        match self {
            Layout::C01B => [0, 1, 2, 3],
            Layout::BC01 => [1, 2, 3, 0],
        }
    }

    /// Permutation taking a c01b tensor to this layout.
    pub(crate) fn from_c01b_axes(self) -> [usize; 4] {
        match self {
            Layout::C01B => [0, 1, 2, 3],
            Layout::BC01 => [3, 0, 1, 2],
        }
    }

    /// Reorders a shape given in this layout to c01b.
    pub fn shape_to_c01b(self, shape: Shape4) -> Shape4 {
        permute_shape(shape, self.to_c01b_axes())
    }

    /// Reorders a c01b shape to this layout.
    pub fn shape_from_c01b(self, shape: Shape4) -> Shape4 {
        permute_shape(shape, self.from_c01b_axes())
    }
}

pub(crate) fn permute_shape(shape: Shape4, axes: [usize; 4]) -> Shape4 {
    let dims = [shape.0, shape.1, shape.2, shape.3];
    (dims[axes[0]], dims[axes[1]], dims[axes[2]], dims[axes[3]])
}

/// Selects training or inference behaviour of every stochastic component
/// (dropout and stochastic pooling) for one evaluation.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ExecutionMode {
    Training,
    Inference,
}

impl ExecutionMode {
    pub fn is_training(self) -> bool {
        self == ExecutionMode::Training
    }
}

pub use activation::Activation;
pub use circular::CircularConvolution;
pub use convolutions::{ConvConfig, Convolution};
pub use error::{Error, Result};
pub use input::InputLayer;
pub use layer::{Layer, LayerId, Pass};
pub use layout::{shuffle_pool_unshuffle, BC01ToC01B, C01BToBC01};
pub use network::Network;
pub use normalization::{CrossMapNorm, CrossMapNormConfig, LocalContrastNorm};
pub use params::{ParamId, ParamOwnership, ParamStore};
pub use pooling::{MaxPooling, Unpooling};
pub use stochastic_pooling::{StochasticPoolConfig, StochasticPooling};
pub use transposed_convolutions::{DeconvConfig, Deconvolution, WeightSharing};
