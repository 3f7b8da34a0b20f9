//! Arena of parameter tensors.
//!
//! Layers never hold tensors directly, they hold [`ParamId`]s into the
//! network's [`ParamStore`]. A deconvolution with tied weights holds the very
//! same ids as its mirror, which makes the sharing explicit: writing a tensor
//! through one id is visible to every layer holding it.

use std::fmt;
use std::path::Path;

use log::{debug, info};
use ndarray::{ArrayD, ArrayView4, ArrayViewD, Ix4, IxDyn};
use ndarray_npy::{read_npy, write_npy, ReadableElement, WritableElement};
use rand::RngCore;
use rand_distr::{Distribution, Normal};

use crate::{
    error::{Error, Result},
    layer::LayerId,
    lit, Element,
};

/// Index of a tensor inside a [`ParamStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Where the tensors referenced by a layer come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOwnership {
    /// The layer has no parameters.
    Stateless,
    /// The layer allocated its own tensors.
    Owns,
    /// The layer reuses the tensors of another layer.
    Borrows(LayerId),
}

#[derive(Debug, Clone, Default)]
pub struct ParamStore<F> {
    tensors: Vec<ArrayD<F>>,
}

impl<F: Element> ParamStore<F> {
    pub fn new() -> Self {
        ParamStore {
            tensors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.tensors.len()).map(ParamId)
    }

    /// Allocates a zero tensor and returns its id.
    pub(crate) fn register(&mut self, shape: &[usize]) -> ParamId {
        let id = ParamId(self.tensors.len());
        debug!("registered parameter {} with shape {:?}", id, shape);
        self.tensors.push(ArrayD::zeros(IxDyn(shape)));
        id
    }

    pub fn get(&self, id: ParamId) -> Result<&ArrayD<F>> {
        self.tensors.get(id.0).ok_or(Error::UnknownParam(id))
    }

    /// Mutable access for external update steps. Never called during `output`.
    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut ArrayD<F>> {
        self.tensors.get_mut(id.0).ok_or(Error::UnknownParam(id))
    }

    /// Replaces a tensor. The new value must have the registered shape.
    pub fn set(&mut self, id: ParamId, value: ArrayD<F>) -> Result<()> {
        let slot = self.get_mut(id)?;
        if slot.shape() != value.shape() {
            return Err(Error::shape(
                "params",
                format!(
                    "parameter {} has shape {:?}, got {:?}",
                    id,
                    slot.shape(),
                    value.shape()
                ),
            ));
        }
        *slot = value;
        Ok(())
    }

    pub(crate) fn view(&self, id: ParamId) -> Result<ArrayViewD<'_, F>> {
        Ok(self.get(id)?.view())
    }

    pub(crate) fn filters(&self, id: ParamId) -> Result<ArrayView4<'_, F>> {
        Ok(self.get(id)?.view().into_dimensionality::<Ix4>()?)
    }

    pub(crate) fn scalar(&self, id: ParamId) -> Result<F> {
        let tensor = self.get(id)?;
        tensor.iter().next().copied().ok_or_else(|| {
            Error::shape("params", format!("parameter {} is empty", id))
        })
    }

    /// Draws every entry from a zero-mean normal distribution.
    pub(crate) fn fill_normal(
        &mut self,
        id: ParamId,
        std: f64,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let normal = Normal::new(0.0, std).map_err(|e| {
            Error::config("params", format!("invalid weight std {}: {}", std, e))
        })?;
        for value in self.get_mut(id)?.iter_mut() {
            let draw: f64 = normal.sample(&mut *rng);
            *value = lit(draw);
        }
        Ok(())
    }

    pub(crate) fn fill(&mut self, id: ParamId, value: f64) -> Result<()> {
        self.get_mut(id)?.fill(lit(value));
        Ok(())
    }
}

impl<F: Element + WritableElement> ParamStore<F> {
    /// Writes the given parameters as `.npy` files into `dir`, one file per
    /// tensor, named after the parameter id.
    pub fn save_npy<P: AsRef<Path>>(&self, dir: P, ids: &[ParamId]) -> Result<()> {
        let dir = dir.as_ref();
        for &id in ids {
            write_npy(dir.join(file_name(id)), self.get(id)?)?;
        }
        info!("saved {} parameters to {}", ids.len(), dir.display());
        Ok(())
    }
}

impl<F: Element + ReadableElement> ParamStore<F> {
    /// Reads parameters written by [`ParamStore::save_npy`]. Every file must
    /// hold a tensor with the registered shape.
    pub fn load_npy<P: AsRef<Path>>(&mut self, dir: P, ids: &[ParamId]) -> Result<()> {
        let dir = dir.as_ref();
        for &id in ids {
            let value: ArrayD<F> = read_npy(dir.join(file_name(id)))?;
            self.set(id, value)?;
        }
        info!("loaded {} parameters from {}", ids.len(), dir.display());
        Ok(())
    }
}

fn file_name(id: ParamId) -> String {
    format!("param_{:04}.npy", id.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn set_rejects_wrong_shape() {
        let mut store = ParamStore::<f32>::new();
        let id = store.register(&[2, 3]);
        assert!(store.set(id, ArrayD::zeros(IxDyn(&[3, 2]))).is_err());
        assert!(store.set(id, ArrayD::ones(IxDyn(&[2, 3]))).is_ok());
        assert_eq!(store.get(id).unwrap().sum(), 6.0);
    }

    #[test]
    fn unknown_ids_are_errors() {
        let store = ParamStore::<f64>::new();
        assert!(matches!(
            store.get(ParamId(3)),
            Err(Error::UnknownParam(ParamId(3)))
        ));
    }

    #[test]
    fn normal_fill_is_seeded() {
        let mut a = ParamStore::<f32>::new();
        let mut b = ParamStore::<f32>::new();
        let ia = a.register(&[4, 4]);
        let ib = b.register(&[4, 4]);
        a.fill_normal(ia, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        b.fill_normal(ib, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.get(ia).unwrap(), b.get(ib).unwrap());
        assert!(a.get(ia).unwrap().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ParamStore::<f32>::new();
        let w = store.register(&[2, 2, 2, 16]);
        let b = store.register(&[16]);
        store.fill_normal(w, 1.0, &mut StdRng::seed_from_u64(0)).unwrap();
        store.fill(b, 0.5).unwrap();
        store.save_npy(dir.path(), &[w, b]).unwrap();

        let mut restored = ParamStore::<f32>::new();
        let w2 = restored.register(&[2, 2, 2, 16]);
        let b2 = restored.register(&[16]);
        restored.load_npy(dir.path(), &[w2, b2]).unwrap();
        assert_eq!(restored.get(w2).unwrap(), store.get(w).unwrap());
        assert_eq!(restored.get(b2).unwrap(), store.get(b).unwrap());
    }
}
