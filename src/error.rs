//! Error type shared by every layer and operator in the crate.

use thiserror::Error;

use crate::{layer::LayerId, params::ParamId};

/// Everything that can go wrong while building or evaluating a layer graph.
///
/// Configuration and shape problems are reported when a layer is constructed,
/// before any data flows. Numeric degeneracies can only show up during
/// evaluation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{layer}: invalid configuration: {reason}")]
    Configuration { layer: &'static str, reason: String },

    #[error("{layer}: shape mismatch: {reason}")]
    ShapeMismatch { layer: &'static str, reason: String },

    #[error("{layer}: numeric degeneracy: {reason}")]
    NumericDegeneracy { layer: &'static str, reason: String },

    #[error("no data was fed to input layer {0}")]
    MissingInput(LayerId),

    #[error("layer {0} does not exist")]
    UnknownLayer(LayerId),

    #[error("parameter {0} does not exist")]
    UnknownParam(ParamId),

    #[error("layer {layer} is a {actual} layer, expected a {expected} layer")]
    WrongLayerKind {
        layer: LayerId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("failed to read parameters: {0}")]
    ReadParams(#[from] ndarray_npy::ReadNpyError),

    #[error("failed to write parameters: {0}")]
    WriteParams(#[from] ndarray_npy::WriteNpyError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(layer: &'static str, reason: impl Into<String>) -> Self {
        Error::Configuration {
            layer,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(layer: &'static str, reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            layer,
            reason: reason.into(),
        }
    }

    pub(crate) fn degenerate(layer: &'static str, reason: impl Into<String>) -> Self {
        Error::NumericDegeneracy {
            layer,
            reason: reason.into(),
        }
    }

    /// True for errors raised while a layer is being configured.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// True for errors caused by incompatible tensor shapes.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, Error::ShapeMismatch { .. } | Error::Shape(_))
    }
}
