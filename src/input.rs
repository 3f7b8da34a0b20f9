use crate::{
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    Activations, Element, Layout, Shape4,
};

/// Root of a layer graph. Declares the shape of the data fed to the network;
/// the data itself is supplied per evaluation through [`Pass::feed`].
#[derive(Debug, Clone)]
pub struct InputLayer {
    id: LayerId,
    n_features: usize,
    width: usize,
    height: usize,
    mb_size: usize,
    layout: Layout,
}

impl InputLayer {
    /// Adds an input layer producing `(n_features, width, height)` images in
    /// minibatches of `mb_size`, in the given layout.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        (n_features, width, height): (usize, usize, usize),
        mb_size: usize,
        layout: Layout,
    ) -> Result<LayerId> {
        if n_features == 0 || width == 0 || height == 0 || mb_size == 0 {
            return Err(Error::config(
                "input",
                format!(
                    "all dimensions must be positive, got {:?} with minibatch size {}",
                    (n_features, width, height),
                    mb_size
                ),
            ));
        }
        let layer = InputLayer {
            id: net.next_id(),
            n_features,
            width,
            height,
            mb_size,
            layout,
        };
        net.insert(layer)
    }
}

impl<F: Element> Layer<F> for InputLayer {
    fn kind(&self) -> &'static str {
        "input"
    }

    fn input_layer(&self) -> Option<LayerId> {
        None
    }

    fn mb_size(&self) -> usize {
        self.mb_size
    }

    fn output_shape(&self) -> Shape4 {
        self.layout
            .shape_from_c01b((self.n_features, self.width, self.height, self.mb_size))
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn output(
        &self,
        _net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let data = match input {
            Some(data) => data,
            None => pass
                .fed(self.id)
                .ok_or(Error::MissingInput(self.id))?
                .to_owned(),
        };
        let expected = Layer::<F>::output_shape(self);
        if data.dim() != expected {
            return Err(Error::shape(
                "input",
                format!("declared shape {:?}, fed {:?}", expected, data.dim()),
            ));
        }
        Ok(data)
    }
}
