//! The capability contract every node of a layer graph satisfies, and the
//! per-evaluation state threaded through `output` calls.

use std::collections::HashMap;
use std::fmt;

use ndarray::ArrayView4;
use rand::RngCore;

use crate::{
    convolutions::Convolution,
    error::Result,
    network::Network,
    params::{ParamId, ParamOwnership, ParamStore},
    pooling::MaxPooling,
    Activations, Element, ExecutionMode, Layout, Shape4,
};

/// Index of a layer inside its [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of one forward evaluation: the execution mode, the data fed to the
/// input layers and the sampler used by dropout and stochastic pooling.
///
/// Nothing is cached between layers. Requesting the same layer twice within a
/// pass recomputes its whole upstream chain and draws fresh samples.
pub struct Pass<'a, F> {
    mode: ExecutionMode,
    feeds: HashMap<LayerId, ArrayView4<'a, F>>,
    rng: &'a mut dyn RngCore,
}

impl<'a, F> Pass<'a, F> {
    pub fn new(mode: ExecutionMode, rng: &'a mut dyn RngCore) -> Self {
        Pass {
            mode,
            feeds: HashMap::new(),
            rng,
        }
    }

    /// Supplies the data produced by an input layer during this pass.
    pub fn feed(mut self, input: LayerId, data: ArrayView4<'a, F>) -> Self {
        self.feeds.insert(input, data);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn rng(&mut self) -> &mut dyn RngCore {
        &mut *self.rng
    }

    pub(crate) fn fed(&self, input: LayerId) -> Option<ArrayView4<'a, F>> {
        self.feeds.get(&input).cloned()
    }
}

/// A node of the layer graph.
///
/// `output_shape` must be a pure function of the layer's configuration and
/// its predecessor's output shape. Layers compute it once at construction.
pub trait Layer<F: Element> {
    /// Short name of the layer kind, used in logs and errors.
    fn kind(&self) -> &'static str;

    /// The single predecessor, `None` for graph roots.
    fn input_layer(&self) -> Option<LayerId>;

    fn mb_size(&self) -> usize;

    fn output_shape(&self) -> Shape4;

    /// Layout of the tensor returned by `output`.
    fn layout(&self) -> Layout {
        Layout::C01B
    }

    /// Computes the activation of this layer. When `input` is given it is
    /// used instead of recursively evaluating the predecessor.
    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>>;

    fn params(&self) -> Vec<ParamId> {
        Vec::new()
    }

    /// The subset of `params` that are biases.
    fn bias_params(&self) -> Vec<ParamId> {
        Vec::new()
    }

    fn trainable(&self) -> bool {
        false
    }

    fn ownership(&self) -> ParamOwnership {
        ParamOwnership::Stateless
    }

    /// Redraws the tensors this layer owns. Borrowed tensors are left alone.
    fn reset_params(&self, _params: &mut ParamStore<F>, _rng: &mut dyn RngCore) -> Result<()> {
        Ok(())
    }

    fn as_convolution(&self) -> Option<&Convolution> {
        None
    }

    fn as_max_pooling(&self) -> Option<&MaxPooling> {
        None
    }
}
