//! Simulation mode: Schedules a cluster fixture in memory.
//!
//! The fixture is applied the way a live cluster would be: nodes register,
//! pre-existing allocations are written, then each job is registered. One
//! worker runs until no evaluation is ready, which leaves blocked and
//! delayed evaluations in place.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corral_core::{Allocation, CorralConfig, Job, Node};
use corral_scheduler::{BlockedStats, BrokerStats, Engine, EvalOutcome};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFixture {
    pub nodes: Vec<Node>,
    pub jobs: Vec<Job>,
    pub allocs: Vec<Allocation>,
}

impl ClusterFixture {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading fixture {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing fixture {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub outcomes: Vec<EvalOutcome>,
    /// Allocations still holding resources after the run.
    pub allocations: Vec<Allocation>,
    pub broker: BrokerStats,
    pub blocked: BlockedStats,
}

pub async fn simulate(config: CorralConfig, fixture: ClusterFixture) -> anyhow::Result<SimulationReport> {
    let engine = Engine::in_memory(config)?;
    let control = engine.control();

    for node in fixture.nodes {
        control.upsert_node(node)?;
    }
    if !fixture.allocs.is_empty() {
        engine.store().upsert_allocs(&fixture.allocs)?;
    }
    for job in fixture.jobs {
        control.register_job(job)?;
    }

    let worker = engine.worker(0);
    let mut outcomes = Vec::new();
    loop {
        match worker.run_once(Duration::ZERO).await {
            Ok(Some(outcome)) => outcomes.push(outcome),
            Ok(None) => break,
            Err(e) => warn!(error = %e, "evaluation failed during simulation"),
        }
    }
    engine.reap()?;

    let allocations: Vec<Allocation> = engine
        .store()
        .list_allocs()?
        .into_iter()
        .filter(|a| !a.terminal_status())
        .collect();
    info!(
        evaluations = outcomes.len(),
        allocations = allocations.len(),
        "simulation finished"
    );
    Ok(SimulationReport {
        outcomes,
        allocations,
        broker: engine.broker().stats(),
        blocked: engine.blocked().stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::EvalStatus;

    fn bundled_fixture() -> ClusterFixture {
        serde_json::from_str(include_str!("../fixtures/cluster.json")).unwrap()
    }

    #[test]
    fn fixture_parses_with_defaults() {
        let fixture = bundled_fixture();
        assert_eq!(fixture.nodes.len(), 2);
        assert_eq!(fixture.jobs.len(), 2);
        assert!(fixture.allocs.is_empty());
        assert_eq!(fixture.jobs[0].namespace, "default");
    }

    #[test]
    fn fixture_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"{"nodes": [], "jobs": []}"#).unwrap();
        let fixture = ClusterFixture::from_file(&path).unwrap();
        assert!(fixture.nodes.is_empty());

        assert!(ClusterFixture::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn simulates_bundled_cluster() {
        let report = simulate(CorralConfig::default(), bundled_fixture()).await.unwrap();

        let web = report.outcomes.iter().find(|o| o.job_id == "web").unwrap();
        assert_eq!(web.status, EvalStatus::Complete);
        assert_eq!(web.placements.len(), 2);
        assert_eq!(web.failed["frontend"].queued, 1);
        assert!(web.blocked_eval.is_some());

        let agents = report.allocations.iter().filter(|a| a.job_id == "node-agent").count();
        assert_eq!(agents, 2);
        assert_eq!(report.blocked.total_blocked, 1);
        assert_eq!(report.allocations.len(), 4);
    }
}
