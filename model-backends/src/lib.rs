//! Model backend abstraction layer.
//!
//! This crate defines the `ModelBackend` trait that hides concrete model
//! runtimes (tensor graph executors, tree ensembles, ...) behind one
//! synchronous interface, plus a registry that maps backend kinds named in
//! configuration to constructors.

mod error;
mod identity;
mod linear;
mod registry;
mod tree;

pub use error::{BackendError, Result};
pub use identity::IdentityBackend;
pub use linear::LinearBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use tree::TreeEnsembleBackend;

use std::path::Path;

use modelgate_common::{Record, Tensor, Value};

/// Primary trait for model backends.
///
/// `run` takes `&self` so that reentrant backends can be shared between
/// threads. A backend that reports `reentrant() == false` is only ever
/// invoked by one worker at a time; the gateway's backend pool enforces
/// that.
pub trait ModelBackend: Send + Sync {
    /// Identifier of this backend type (e.g. "linear", "tree-ensemble").
    fn kind(&self) -> &'static str;

    /// Whether concurrent `run` calls on one instance are safe.
    fn reentrant(&self) -> bool {
        false
    }

    /// Largest batch the backend wants in a single `run` call.
    fn max_batch_hint(&self) -> Option<usize> {
        None
    }

    /// Load model state, optionally from a file.
    fn load(&mut self, path: Option<&Path>) -> Result<()>;

    /// Run one invocation over a batch of input records, returning one
    /// output record per input in the same order.
    fn run(&self, batch: &[Record]) -> Result<Vec<Record>>;

    /// Release resources held by the backend.
    fn close(&self) {}
}

/// Pick the input tensor: the named field if present, otherwise the only
/// tensor in the record.
pub(crate) fn input_tensor<'a>(record: &'a Record, name: &str) -> Result<&'a Tensor> {
    if let Some(value) = record.get(name) {
        return value
            .as_tensor()
            .ok_or_else(|| BackendError::InvalidInput(format!("field '{}' is not a tensor", name)));
    }
    let mut tensors = record.iter().filter_map(|(_, v)| match v {
        Value::Tensor(t) => Some(t),
        _ => None,
    });
    match (tensors.next(), tensors.next()) {
        (Some(t), None) => Ok(t),
        _ => Err(BackendError::InvalidInput(format!(
            "expected input tensor '{}'",
            name
        ))),
    }
}

/// Split a tensor into `(rows, features)`: the leading extent is the batch
/// axis for rank ≥ 2, otherwise the tensor is a single row.
pub(crate) fn rows_and_features(tensor: &Tensor) -> (usize, usize) {
    let count = tensor.element_count();
    match tensor.shape() {
        [rows, ..] if tensor.rank() >= 2 => {
            let rows = *rows;
            (rows, if rows == 0 { 0 } else { count / rows })
        }
        _ => (1, count),
    }
}
