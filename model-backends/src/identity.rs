//! Pass-through backend.

use std::path::Path;

use modelgate_common::Record;

use super::{ModelBackend, Result};

/// Returns every input record unchanged. Useful for wiring tests and for
/// pipelines whose model step is still being developed.
#[derive(Debug, Default)]
pub struct IdentityBackend;

impl IdentityBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModelBackend for IdentityBackend {
    fn kind(&self) -> &'static str {
        "identity"
    }

    fn reentrant(&self) -> bool {
        true
    }

    fn load(&mut self, _path: Option<&Path>) -> Result<()> {
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        Ok(batch.to_vec())
    }
}
