//! Dropout, shared by every layer that takes a dropout rate.

use rand::{Rng, RngCore};

use crate::{
    error::{Error, Result},
    lit, Activations, Element, ExecutionMode,
};

/// Inverted dropout: in training mode every activation is zeroed with
/// probability `rate` and the survivors are scaled by `1 / (1 - rate)`, so
/// nothing needs rescaling at inference time. Inference mode and a zero rate
/// pass the input through untouched.
pub fn dropout<F: Element>(
    mut input: Activations<F>,
    rate: f64,
    mode: ExecutionMode,
    rng: &mut dyn RngCore,
) -> Activations<F> {
    if !mode.is_training() || rate <= 0.0 {
        return input;
    }
    let retain_prob = 1.0 - rate;
    let scale: F = lit(1.0 / retain_prob);
    for value in input.iter_mut() {
        if rng.gen_bool(retain_prob) {
            *value *= scale;
        } else {
            *value = F::zero();
        }
    }
    input
}

pub(crate) fn check_rate(layer: &'static str, rate: f64) -> Result<()> {
    if (0.0..1.0).contains(&rate) {
        Ok(())
    } else {
        Err(Error::config(
            layer,
            format!("dropout rate must be in [0, 1), got {}", rate),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn inference_passes_through() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = Array4::<f32>::ones((4, 3, 3, 2));
        let y = dropout(x.clone(), 0.5, ExecutionMode::Inference, &mut rng);
        assert_eq!(x, y);
    }

    #[test]
    fn training_zeroes_or_rescales() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = Array4::<f32>::ones((8, 8, 8, 4));
        let y = dropout(x, 0.5, ExecutionMode::Training, &mut rng);
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.iter().filter(|&&v| v != 0.0).count();
        assert!(kept > 0 && kept < y.len());
    }

    #[test]
    fn zero_rate_is_identity_in_training() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = Array4::<f64>::from_elem((2, 2, 2, 2), 3.0);
        let y = dropout(x.clone(), 0.0, ExecutionMode::Training, &mut rng);
        assert_eq!(x, y);
    }

    #[test]
    fn rates_outside_unit_interval_are_rejected() {
        assert!(check_rate("conv", 1.0).is_err());
        assert!(check_rate("conv", -0.1).is_err());
        assert!(check_rate("conv", 0.0).is_ok());
    }
}
