//! In-process backends with controllable timing and output.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modelgate_backends::{ModelBackend, Result};
use modelgate_common::Record;

/// Echoes its inputs after sleeping. Not reentrant.
#[derive(Debug)]
pub struct SlowBackend {
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ModelBackend for SlowBackend {
    fn kind(&self) -> &'static str {
        "slow"
    }

    fn load(&mut self, _path: Option<&Path>) -> Result<()> {
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        std::thread::sleep(self.delay);
        Ok(batch.to_vec())
    }
}

/// Echoes its inputs and counts `run` calls across all instances.
#[derive(Debug)]
pub struct CountingBackend {
    calls: Arc<AtomicUsize>,
}

impl CountingBackend {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self { calls }
    }
}

impl ModelBackend for CountingBackend {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn load(&mut self, _path: Option<&Path>) -> Result<()> {
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(batch.to_vec())
    }
}

/// Answers every input with the same record, e.g. fixed classifier scores.
#[derive(Debug, Clone)]
pub struct FixedOutputBackend {
    output: Record,
    delay: Duration,
}

impl FixedOutputBackend {
    pub fn new(output: Record) -> Self {
        Self {
            output,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelBackend for FixedOutputBackend {
    fn kind(&self) -> &'static str {
        "fixed"
    }

    fn load(&mut self, _path: Option<&Path>) -> Result<()> {
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(vec![self.output.clone(); batch.len()])
    }
}
