//! Layers reordering axes between the c01b layout of the windowed operators
//! and the bc01 layout, so that components expecting either can be chained.

use crate::{
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    permute_shape,
    pooling::MaxPooling,
    Activations, Element, Layout, Shape4,
};

/// Permutes axes of the predecessor's output. Parameter free.
#[derive(Debug, Clone)]
struct Shuffle {
    input_layer: LayerId,
    input_shape: Shape4,
    axes: [usize; 4],
}

impl Shuffle {
    fn new<F: Element>(
        net: &Network<F>,
        kind: &'static str,
        input: LayerId,
        from: Layout,
        to: Layout,
    ) -> Result<Self> {
        let predecessor = net.layer(input)?;
        if predecessor.layout() != from {
            return Err(Error::shape(
                kind,
                format!(
                    "input layer {} produces {:?} activations, expected {:?}",
                    input,
                    predecessor.layout(),
                    from
                ),
            ));
        }
        let to_c01b = from.to_c01b_axes();
        let axes = to.from_c01b_axes().map(|axis| to_c01b[axis]);
        Ok(Shuffle {
            input_layer: input,
            input_shape: predecessor.output_shape(),
            axes,
        })
    }

    fn output_shape(&self) -> Shape4 {
        permute_shape(self.input_shape, self.axes)
    }

    fn output<F: Element>(
        &self,
        kind: &'static str,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input = net.upstream(kind, self.input_layer, self.input_shape, pass, input)?;
        Ok(input
            .permuted_axes(self.axes)
            .as_standard_layout()
            .into_owned())
    }
}

/// c01b (windowed operators) to bc01.
#[derive(Debug, Clone)]
pub struct C01BToBC01 {
    shuffle: Shuffle,
}

impl C01BToBC01 {
    pub fn new<F: Element>(net: &mut Network<F>, input: LayerId) -> Result<LayerId> {
        let shuffle = Shuffle::new(net, "c01b to bc01", input, Layout::C01B, Layout::BC01)?;
        net.insert(C01BToBC01 { shuffle })
    }
}

impl<F: Element> Layer<F> for C01BToBC01 {
    fn kind(&self) -> &'static str {
        "c01b to bc01"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.shuffle.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.shuffle.input_shape.3
    }

    fn output_shape(&self) -> Shape4 {
        self.shuffle.output_shape()
    }

    fn layout(&self) -> Layout {
        Layout::BC01
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        self.shuffle.output("c01b to bc01", net, pass, input)
    }
}

/// bc01 back to c01b.
#[derive(Debug, Clone)]
pub struct BC01ToC01B {
    shuffle: Shuffle,
}

impl BC01ToC01B {
    pub fn new<F: Element>(net: &mut Network<F>, input: LayerId) -> Result<LayerId> {
        let shuffle = Shuffle::new(net, "bc01 to c01b", input, Layout::BC01, Layout::C01B)?;
        net.insert(BC01ToC01B { shuffle })
    }
}

impl<F: Element> Layer<F> for BC01ToC01B {
    fn kind(&self) -> &'static str {
        "bc01 to c01b"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.shuffle.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.shuffle.input_shape.0
    }

    fn output_shape(&self) -> Shape4 {
        self.shuffle.output_shape()
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        self.shuffle.output("bc01 to c01b", net, pass, input)
    }
}

/// Max pooling of c01b activations carried out in bc01 layout, flanked by the
/// two adapters. Returns the final (c01b) layer.
pub fn shuffle_pool_unshuffle<F: Element>(
    net: &mut Network<F>,
    input: LayerId,
    pool_size: usize,
    stride: Option<usize>,
) -> Result<LayerId> {
    let bc01 = C01BToBC01::new(net, input)?;
    let pool = MaxPooling::new(net, bc01, pool_size, stride)?;
    BC01ToC01B::new(net, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionMode, InputLayer};
    use ndarray::Array4;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn adapters_permute_shapes() {
        let mut net = Network::<f32>::seeded(0);
        let input = InputLayer::new(&mut net, (3, 5, 7), 2, Layout::C01B).unwrap();
        let bc01 = C01BToBC01::new(&mut net, input).unwrap();
        let c01b = BC01ToC01B::new(&mut net, bc01).unwrap();
        assert_eq!(net.output_shape(bc01).unwrap(), (2, 3, 5, 7));
        assert_eq!(net.output_shape(c01b).unwrap(), (3, 5, 7, 2));
        assert_eq!(net.layer(c01b).unwrap().mb_size(), 2);
    }

    #[test]
    fn adapters_check_the_input_layout() {
        let mut net = Network::<f32>::seeded(0);
        let input = InputLayer::new(&mut net, (3, 5, 7), 2, Layout::C01B).unwrap();
        assert!(BC01ToC01B::new(&mut net, input).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn shuffled_pooling_equals_direct_pooling() {
        let mut net = Network::<f64>::seeded(0);
        let input = InputLayer::new(&mut net, (2, 6, 5), 2, Layout::C01B).unwrap();
        let direct = MaxPooling::new(&mut net, input, 3, Some(2)).unwrap();
        let shuffled = shuffle_pool_unshuffle(&mut net, input, 3, Some(2)).unwrap();
        assert_eq!(net.output_shape(direct).unwrap(), net.output_shape(shuffled).unwrap());

        let data = Array4::from_shape_fn((2, 6, 5, 2), |(c, x, y, b)| ((c * 3 + x * 5 + y * 2 + b * 7) % 9) as f64);
        let mut rng = StdRng::seed_from_u64(0);
        let mut pass = Pass::new(ExecutionMode::Inference, &mut rng).feed(input, data.view());
        assert_eq!(
            net.output(direct, &mut pass).unwrap(),
            net.output(shuffled, &mut pass).unwrap()
        );
    }
}
