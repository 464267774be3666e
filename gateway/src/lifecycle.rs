//! Startup, readiness and shutdown of the pipeline's stages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::pipeline::Pipeline;

const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Where a stage is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Created,
    Initialized,
    Warm,
    Running,
    Draining,
    Stopped,
}

impl StageState {
    pub fn is_ready(self) -> bool {
        matches!(self, StageState::Warm | StageState::Running)
    }
}

/// Owns the pipeline and tracks the requests running through it.
pub struct Lifecycle {
    pipeline: Pipeline,
    states: RwLock<Vec<StageState>>,
    draining: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    warm_on_start: bool,
    drain_timeout: Duration,
}

/// Held by a request for as long as it runs through the pipeline.
pub struct InFlight<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.lifecycle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.idle.notify_waiters();
        }
    }
}

impl Lifecycle {
    pub fn new(pipeline: Pipeline, config: &GatewayConfig) -> Self {
        let states = vec![StageState::Created; pipeline.stages().len()];
        Self {
            pipeline,
            states: RwLock::new(states),
            draining: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            warm_on_start: config.warm_on_start,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn set_state(&self, index: usize, state: StageState) {
        if let Some(slot) = self.states.write().get_mut(index) {
            *slot = state;
        }
    }

    fn set_all(&self, state: StageState) {
        self.states.write().iter_mut().for_each(|s| *s = state);
    }

    /// Initialize every stage in order, then warm them. A failure closes
    /// the stages already initialized.
    pub async fn start(&self) -> Result<()> {
        let stages = self.pipeline.stages();
        for (index, stage) in stages.iter().enumerate() {
            tracing::debug!(stage = %stage.name(), kind = stage.kind(), "Initializing stage");
            if let Err(e) = stage.init().await {
                tracing::error!(stage = %stage.name(), "Stage failed to initialize: {}", e);
                self.close_stages(index).await;
                return Err(e);
            }
            self.set_state(index, StageState::Initialized);
        }

        for (index, stage) in stages.iter().enumerate() {
            if self.warm_on_start {
                if let Err(e) = stage.warm().await {
                    tracing::error!(stage = %stage.name(), "Stage failed to warm up: {}", e);
                    self.close_stages(stages.len()).await;
                    return Err(e);
                }
            }
            self.set_state(index, StageState::Warm);
        }

        tracing::info!(stages = stages.len(), warmed = self.warm_on_start, "Pipeline ready");
        Ok(())
    }

    /// Called once the listener accepts traffic.
    pub fn mark_running(&self) {
        let mut states = self.states.write();
        for state in states.iter_mut().filter(|s| **s == StageState::Warm) {
            *state = StageState::Running;
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.draining.load(Ordering::Acquire) && self.states.read().iter().all(|s| s.is_ready())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stage names with their current state, in pipeline order.
    pub fn states(&self) -> Vec<(String, StageState)> {
        let states = self.states.read();
        self.pipeline
            .stages()
            .iter()
            .zip(states.iter())
            .map(|(stage, state)| (stage.name().to_string(), *state))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit one request, or fail with `NotReady` while starting or draining.
    pub fn admit(&self) -> Result<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight { lifecycle: self };
        if self.is_draining() {
            return Err(GatewayError::NotReady("gateway is shutting down".into()));
        }
        if !self.is_ready() {
            return Err(GatewayError::NotReady("pipeline is not ready".into()));
        }
        Ok(guard)
    }

    /// Refuse new requests, wait for in-flight ones up to the drain
    /// timeout, then close stages in reverse order.
    pub async fn shutdown(&self) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_all(StageState::Draining);
        tracing::info!(in_flight = self.in_flight(), "Draining in-flight requests");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while self.in_flight() > 0 {
                tokio::select! {
                    _ = self.idle.notified() => {}
                    _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = self.in_flight(),
                "Drain timeout reached; closing stages with requests still running"
            );
        }

        self.close_stages(self.pipeline.stages().len()).await;
        tracing::info!("Pipeline stopped");
    }

    /// Close stages `0..count` in reverse order.
    async fn close_stages(&self, count: usize) {
        for (index, stage) in self.pipeline.stages().iter().enumerate().take(count).rev() {
            stage.close().await;
            self.set_state(index, StageState::Stopped);
            tracing::debug!(stage = %stage.name(), "Stage closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{config_with_steps, script_step};
    use modelgate_backends::BackendRegistry;
    use std::sync::Arc;

    fn lifecycle(config: &GatewayConfig) -> Lifecycle {
        let pipeline = Pipeline::build(
            config,
            &BackendRegistry::with_builtin(),
            Arc::new(crate::metrics::Metrics::new(&[])),
        )
        .unwrap();
        Lifecycle::new(pipeline, config)
    }

    #[tokio::test]
    async fn test_ready_after_start() {
        let config = config_with_steps(vec![script_step()]);
        let lifecycle = lifecycle(&config);
        assert!(!lifecycle.is_ready());
        assert_eq!(lifecycle.admit().err().unwrap().kind(), "NotReady");

        lifecycle.start().await.unwrap();
        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.states()[0].1, StageState::Warm);

        lifecycle.mark_running();
        assert_eq!(lifecycle.states()[0].1, StageState::Running);
        assert!(lifecycle.is_ready());
    }

    #[tokio::test]
    async fn test_failed_init_reports_error() {
        let mut step = script_step();
        step["code"] = "second = ".into();
        let config = config_with_steps(vec![step]);
        let lifecycle = lifecycle(&config);
        let err = lifecycle.start().await.unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(!lifecycle.is_ready());
    }

    #[tokio::test]
    async fn test_admit_tracks_in_flight() {
        let config = config_with_steps(vec![script_step()]);
        let lifecycle = lifecycle(&config);
        lifecycle.start().await.unwrap();
        {
            let _a = lifecycle.admit().unwrap();
            let _b = lifecycle.admit().unwrap();
            assert_eq!(lifecycle.in_flight(), 2);
        }
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let config = config_with_steps(vec![script_step()]);
        let lifecycle = Arc::new(lifecycle(&config));
        lifecycle.start().await.unwrap();

        let request = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                let _guard = lifecycle.admit().unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        lifecycle.shutdown().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(lifecycle.in_flight(), 0);
        assert_eq!(lifecycle.states()[0].1, StageState::Stopped);
        assert_eq!(lifecycle.admit().err().unwrap().to_string(), "gateway is shutting down");
        request.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_timeout_bounds_shutdown() {
        let mut config = config_with_steps(vec![script_step()]);
        config.drain_timeout_ms = 30;
        let lifecycle = lifecycle(&config);
        lifecycle.start().await.unwrap();

        let _stuck = lifecycle.admit().unwrap();
        let started = std::time::Instant::now();
        lifecycle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lifecycle.states()[0].1, StageState::Stopped);
    }
}
