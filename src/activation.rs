//! Elementwise nonlinearities applied at the end of the convolution layers.

use crate::{lit, Activations, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    Identity,
    #[default]
    Rectify,
    Sigmoid,
    Tanh,
    /// `x` for positive inputs, `alpha * x` otherwise, with `alpha` learned
    /// per layer.
    ParametricRectify,
}

impl Activation {
    /// Whether the activation needs a learned `alpha` scalar.
    pub fn is_parametric(self) -> bool {
        matches!(self, Activation::ParametricRectify)
    }

    /// Applies the nonlinearity in place. `alpha` is ignored by the fixed
    /// activations.
    pub fn apply<F: Element>(self, mut x: Activations<F>, alpha: F) -> Activations<F> {
        match self {
            Activation::Identity => {}
            Activation::Rectify => x.mapv_inplace(|v| v.max(F::zero())),
            Activation::Sigmoid => {
                let one = F::one();
                x.mapv_inplace(|v| one / (one + (-v).exp()))
            }
            Activation::Tanh => x.mapv_inplace(|v| v.tanh()),
            Activation::ParametricRectify => x.mapv_inplace(|v| {
                if v > F::zero() {
                    v
                } else {
                    alpha * v
                }
            }),
        }
        x
    }
}

/// Initial value of a parametric activation's `alpha`.
pub(crate) fn initial_alpha<F: Element>() -> F {
    lit(0.0)
}
