//! Readiness stays consistent with parent states however a random DAG is
//! partially executed, including when operator commands land mid-way.

use engine::{Engine, EngineConfig, FWorker, FireworkSpec, FwId, FwState, RuntimeInfo, WfId, WorkflowSpec};
use proptest::prelude::*;
use tasks::FwAction;

fn build(n: usize, edges: &[bool]) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("random");
    for id in 1..=n as FwId {
        spec = spec.with_firework(FireworkSpec::new(id, format!("fw{id}")));
    }
    let mut bit = 0;
    for parent in 1..=n as FwId {
        for child in parent + 1..=n as FwId {
            if edges[bit] {
                spec.link(parent, child);
            }
            bit += 1;
        }
    }
    spec
}

/// An operator command applied between two rounds of execution.
#[derive(Debug, Clone, Copy)]
enum Command {
    Archive(FwId),
    Defuse(FwId),
}

async fn run_steps(engine: &Engine, outcomes: &[bool]) {
    let worker = FWorker::default();
    for &succeed in outcomes {
        let Some(claim) = engine.claim(&worker).await.unwrap() else {
            break;
        };
        engine
            .mark_running(claim.launch_id, RuntimeInfo::default())
            .await
            .unwrap();
        let action = if succeed {
            FwAction::success()
        } else {
            FwAction::failure("random failure")
        };
        engine.complete_launch(claim.launch_id, action).await.unwrap();
    }
}

async fn execute(spec: WorkflowSpec, outcomes: Vec<bool>, steps: usize, commands: &[Command]) -> (Engine, WfId) {
    let engine = Engine::in_memory(EngineConfig::default());
    let submitted = engine.submit(spec).await.unwrap();
    let (before, after) = outcomes.split_at(steps);

    run_steps(&engine, before).await;
    for &command in commands {
        // Commands the state table forbids are simply rejected.
        let _ = match command {
            Command::Archive(local) => engine.archive(submitted.id_map[&local]).await,
            Command::Defuse(local) => engine.defuse(submitted.id_map[&local]).await,
        };
    }
    run_steps(&engine, after).await;
    (engine, submitted.wf_id)
}

fn scenario() -> impl Strategy<Value = (usize, Vec<bool>, Vec<bool>, usize, Vec<Command>)> {
    (2usize..8).prop_flat_map(|n| {
        let command = (1..=n as FwId, any::<bool>()).prop_map(|(local, archive)| {
            if archive {
                Command::Archive(local)
            } else {
                Command::Defuse(local)
            }
        });
        (
            Just(n),
            proptest::collection::vec(any::<bool>(), n * (n - 1) / 2),
            proptest::collection::vec(any::<bool>(), 2 * n),
            0..=n,
            proptest::collection::vec(command, 0..3),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ready_exactly_when_all_parents_completed((n, edges, outcomes, steps, commands) in scenario()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (engine, wf_id) = runtime.block_on(execute(build(n, &edges), outcomes, steps, &commands));

        runtime.block_on(async {
            let wf = engine.workflow(wf_id).await.unwrap();
            for &fw_id in &wf.nodes {
                let state = engine.firework(fw_id).await.unwrap().state;
                let mut parents_done = true;
                for parent in wf.parents(fw_id) {
                    parents_done &= engine.firework(parent).await.unwrap().state == FwState::Completed;
                }

                match state {
                    FwState::Ready => prop_assert!(parents_done, "fw {} READY with unfinished parents", fw_id),
                    FwState::Waiting => prop_assert!(!parents_done, "fw {} WAITING with finished parents", fw_id),
                    // A parent archived or defused after its child ran does not
                    // undo the child.
                    FwState::Completed | FwState::Fizzled => prop_assert!(parents_done || !commands.is_empty()),
                    FwState::Archived | FwState::Defused => prop_assert!(!commands.is_empty()),
                    other => prop_assert!(false, "unexpected state {} for fw {}", other, fw_id),
                }
                prop_assert_eq!(wf.fw_states[&fw_id], state);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
