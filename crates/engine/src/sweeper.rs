//! Periodic recovery of stale reservations and lost runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config::SweeperConfig;
use crate::models::{timestamp, LaunchId};
use crate::{Engine, EngineError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Launches whose reservation expired; their fireworks are READY again.
    pub unreserved: Vec<LaunchId>,
    /// RUNNING launches that stopped pinging and were fizzled.
    pub lost_runs: Vec<LaunchId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.unreserved.is_empty() && self.lost_runs.is_empty()
    }
}

pub struct Sweeper {
    engine: Arc<Engine>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        self.sweep_at(timestamp::now()).await
    }

    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let report = SweepReport {
            unreserved: self.engine.detect_unreserved_at(now).await?,
            lost_runs: self.engine.detect_lostruns_at(now).await?,
        };
        if !report.is_empty() {
            info!(
                unreserved = report.unreserved.len(),
                lost_runs = report.lost_runs.len(),
                "sweep recovered launches"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until the handle is aborted. Failed sweeps are
    /// logged and retried on the next tick.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once().await {
                    error!(error = %err, "sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{FireworkSpec, WorkflowSpec};
    use crate::config::EngineConfig;
    use crate::lifecycle::RuntimeInfo;
    use crate::models::{FWorker, FwState};
    use std::time::Duration;

    async fn engine_with_two_claims() -> (Arc<Engine>, LaunchId, LaunchId) {
        let engine = Arc::new(Engine::in_memory(EngineConfig {
            reservation_ttl: Duration::from_secs(60),
            lostrun_ttl: Duration::from_secs(120),
            ..EngineConfig::default()
        }));
        let spec = WorkflowSpec::new("pair")
            .with_firework(FireworkSpec::new(1, "reserved"))
            .with_firework(FireworkSpec::new(2, "running"));
        engine.submit(spec).await.unwrap();

        let worker = FWorker::default();
        let reserved = engine.claim(&worker).await.unwrap().unwrap();
        let running = engine.claim(&worker).await.unwrap().unwrap();
        engine
            .mark_running(running.launch_id, RuntimeInfo::default())
            .await
            .unwrap();
        (engine, reserved.launch_id, running.launch_id)
    }

    #[tokio::test]
    async fn fresh_launches_are_left_alone() {
        let (engine, _, _) = engine_with_two_claims().await;
        let sweeper = Sweeper::new(engine, SweeperConfig::default());
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_launches_are_recovered_once() {
        let (engine, reserved, running) = engine_with_two_claims().await;
        let sweeper = Sweeper::new(Arc::clone(&engine), SweeperConfig::default());

        let later = timestamp::now() + chrono::Duration::seconds(600);
        let report = sweeper.sweep_at(later).await.unwrap();
        assert_eq!(report.unreserved, vec![reserved]);
        assert_eq!(report.lost_runs, vec![running]);

        assert!(sweeper.sweep_at(later).await.unwrap().is_empty());
        assert_eq!(engine.launch(running).await.unwrap().state, FwState::Fizzled);
    }
}
