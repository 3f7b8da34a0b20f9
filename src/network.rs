//! The layer graph: an arena of layers plus the parameter tensors they use.

use log::{debug, info, trace};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    convolutions::Convolution,
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    params::{ParamId, ParamOwnership, ParamStore},
    pooling::MaxPooling,
    Activations, Element, Shape4,
};

/// A graph of layers, built once top-down and evaluated pull-style.
///
/// Layers are referenced by [`LayerId`] and can only point at layers that
/// were added before them, so the graph is acyclic by construction.
pub struct Network<F: Element> {
    layers: Vec<Box<dyn Layer<F>>>,
    params: ParamStore<F>,
    rng: StdRng,
}

impl<F: Element> Default for Network<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Element> Network<F> {
    /// Creates an empty network whose parameter initialization is seeded
    /// from the operating system.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates an empty network with reproducible parameter initialization.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Network {
            layers: Vec::new(),
            params: ParamStore::new(),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Id the next added layer will receive.
    pub(crate) fn next_id(&self) -> LayerId {
        LayerId(self.layers.len())
    }

    /// Adds a fully configured layer and draws its initial parameters.
    pub(crate) fn insert<L: Layer<F> + 'static>(&mut self, layer: L) -> Result<LayerId> {
        let id = self.next_id();
        layer.reset_params(&mut self.params, &mut self.rng)?;
        debug!(
            "added {} layer {} with output shape {:?} ({:?})",
            layer.kind(),
            id,
            layer.output_shape(),
            layer.ownership()
        );
        self.layers.push(Box::new(layer));
        Ok(id)
    }

    pub(crate) fn register_param(&mut self, shape: &[usize]) -> ParamId {
        self.params.register(shape)
    }

    pub fn layer(&self, id: LayerId) -> Result<&dyn Layer<F>> {
        self.layers
            .get(id.0)
            .map(|layer| layer.as_ref())
            .ok_or(Error::UnknownLayer(id))
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> {
        (0..self.layers.len()).map(LayerId)
    }

    pub(crate) fn convolution(&self, id: LayerId) -> Result<&Convolution> {
        let layer = self.layer(id)?;
        layer.as_convolution().ok_or(Error::WrongLayerKind {
            layer: id,
            expected: "convolution",
            actual: layer.kind(),
        })
    }

    pub(crate) fn max_pooling(&self, id: LayerId) -> Result<&MaxPooling> {
        let layer = self.layer(id)?;
        layer.as_max_pooling().ok_or(Error::WrongLayerKind {
            layer: id,
            expected: "max pooling",
            actual: layer.kind(),
        })
    }

    pub fn output_shape(&self, id: LayerId) -> Result<Shape4> {
        Ok(self.layer(id)?.output_shape())
    }

    /// Evaluates a layer, recursively evaluating everything upstream of it.
    pub fn output(&self, id: LayerId, pass: &mut Pass<'_, F>) -> Result<Activations<F>> {
        let layer = self.layer(id)?;
        trace!("evaluating {} layer {} ({:?})", layer.kind(), id, pass.mode());
        layer.output(self, pass, None)
    }

    /// Evaluates a layer on an already computed input, skipping its
    /// predecessor.
    pub fn output_from(
        &self,
        id: LayerId,
        pass: &mut Pass<'_, F>,
        input: Activations<F>,
    ) -> Result<Activations<F>> {
        let layer = self.layer(id)?;
        trace!("evaluating {} layer {} on a given input", layer.kind(), id);
        layer.output(self, pass, Some(input))
    }

    /// Resolves the input of a layer: either the precomputed tensor or the
    /// output of its predecessor. The result must have the expected shape.
    pub(crate) fn upstream(
        &self,
        kind: &'static str,
        predecessor: LayerId,
        expected: Shape4,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input = match input {
            Some(input) => input,
            None => self.output(predecessor, pass)?,
        };
        if input.dim() != expected {
            return Err(Error::shape(
                kind,
                format!("expected input of shape {:?}, got {:?}", expected, input.dim()),
            ));
        }
        Ok(input)
    }

    pub fn params(&self) -> &ParamStore<F> {
        &self.params
    }

    /// Mutable access to the parameters, for the update step of a training
    /// loop. Updates must not overlap with an evaluation.
    pub fn params_mut(&mut self) -> &mut ParamStore<F> {
        &mut self.params
    }

    pub fn ownership(&self, id: LayerId) -> Result<ParamOwnership> {
        Ok(self.layer(id)?.ownership())
    }

    /// Every parameter of every trainable layer, each listed once, in the
    /// order the layers were added.
    pub fn trainable_params(&self) -> Vec<ParamId> {
        let mut ids = Vec::new();
        for layer in self.layers.iter().filter(|layer| layer.trainable()) {
            for id in layer.params() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// The trainable parameters that are biases, which usually get a
    /// different weight decay and learning rate.
    pub fn bias_params(&self) -> Vec<ParamId> {
        let trainable = self.trainable_params();
        let mut ids = Vec::new();
        for layer in &self.layers {
            for id in layer.bias_params() {
                if trainable.contains(&id) && !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Redraws every owned parameter tensor without rebuilding the graph.
    pub fn reset_params(&mut self) -> Result<()> {
        for layer in &self.layers {
            layer.reset_params(&mut self.params, &mut self.rng)?;
        }
        info!(
            "reset parameters of {} layers ({} tensors)",
            self.layers.len(),
            self.params.len()
        );
        Ok(())
    }
}
