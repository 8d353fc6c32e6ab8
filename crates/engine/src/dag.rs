//! DAG validation — run this before submitting or splicing a workflow.
//!
//! Rules enforced:
//! 1. A workflow has at least one firework.
//! 2. Firework ids must be unique within the workflow.
//! 3. Every link must reference known fireworks (parent and child side).
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of firework ids on success. Ties are
//! broken by document order so the result is deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::compose::WorkflowSpec;
use crate::error::StructuralError;
use crate::models::{FwId, Workflow};

/// Validate the workflow's DAG and return its fireworks in topological order.
///
/// # Errors
/// - [`StructuralError::EmptyWorkflow`] if there are no fireworks.
/// - [`StructuralError::DuplicateNodeId`] if two fireworks share an id.
/// - [`StructuralError::UnknownNodeReference`] if a link references a missing firework.
/// - [`StructuralError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(workflow: &WorkflowSpec) -> Result<Vec<FwId>, StructuralError> {
    if workflow.fireworks.is_empty() {
        return Err(StructuralError::EmptyWorkflow);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure firework ids are unique
    // -----------------------------------------------------------------------
    let mut node_set: HashSet<FwId> = HashSet::new();
    for fw in &workflow.fireworks {
        if !node_set.insert(fw.fw_id) {
            return Err(StructuralError::DuplicateNodeId(fw.fw_id));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate link endpoints
    // -----------------------------------------------------------------------
    for (parent, children) in &workflow.links {
        if !node_set.contains(parent) {
            return Err(StructuralError::UnknownNodeReference {
                node_id: *parent,
                side: "parent",
            });
        }
        for child in children {
            if !node_set.contains(child) {
                return Err(StructuralError::UnknownNodeReference {
                    node_id: *child,
                    side: "child",
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut in_degree: HashMap<FwId, usize> =
        workflow.fireworks.iter().map(|fw| (fw.fw_id, 0)).collect();
    for child in workflow.links.values().flatten() {
        *in_degree.entry(*child).or_insert(0) += 1;
    }

    // Seed the queue with roots, in document order.
    let mut queue: VecDeque<FwId> = workflow
        .fireworks
        .iter()
        .map(|fw| fw.fw_id)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<FwId> = Vec::with_capacity(workflow.fireworks.len());

    while let Some(fw_id) = queue.pop_front() {
        sorted.push(fw_id);

        for child in workflow.links.get(&fw_id).into_iter().flatten() {
            let deg = in_degree.entry(*child).or_insert(0);
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(*child);
            }
        }
    }

    // If we didn't visit every firework the graph contains a cycle.
    if sorted.len() != workflow.fireworks.len() {
        return Err(StructuralError::CycleDetected);
    }

    Ok(sorted)
}

/// Check that linking a new fragment below `parents` and above `children`
/// keeps `workflow` acyclic.
///
/// The fragment itself is validated separately and is fresh, so a cycle can
/// only close through existing nodes: it exists iff some child already
/// reaches some parent.
pub fn check_insertion(
    workflow: &Workflow,
    parents: &[FwId],
    children: &[FwId],
) -> Result<(), StructuralError> {
    for &node in parents.iter().chain(children) {
        if !workflow.contains(node) {
            return Err(StructuralError::UnknownNodeReference {
                node_id: node,
                side: if parents.contains(&node) { "parent" } else { "child" },
            });
        }
    }
    for &child in children {
        for &parent in parents {
            if workflow.reaches(child, parent) {
                return Err(StructuralError::InsertionCycle { parent, child });
            }
        }
    }
    Ok(())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::FireworkSpec;
    use crate::models::{timestamp, FwState};

    fn make_workflow(ids: &[FwId], links: &[(FwId, FwId)]) -> WorkflowSpec {
        let mut wf = WorkflowSpec::new("test");
        for &id in ids {
            wf.fireworks.push(FireworkSpec::new(id, format!("fw{id}")));
        }
        for &(parent, child) in links {
            wf.link(parent, child);
        }
        wf
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // 1 → 2 → 3, listed out of order
        let workflow = make_workflow(&[3, 1, 2], &[(1, 2), (2, 3)]);
        let sorted = validate_dag(&workflow).expect("should be valid");
        assert_eq!(sorted, vec![1, 2, 3]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   1
        //  / \
        // 2   3
        //  \ /
        //   4
        let workflow = make_workflow(&[1, 2, 3, 4], &[(1, 2), (1, 3), (2, 4), (3, 4)]);
        let sorted = validate_dag(&workflow).expect("should be valid");
        assert_eq!(sorted.first(), Some(&1));
        assert_eq!(sorted.last(), Some(&4));
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let workflow = make_workflow(&[], &[]);
        assert_eq!(validate_dag(&workflow), Err(StructuralError::EmptyWorkflow));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let workflow = make_workflow(&[-1, -1], &[]);
        assert_eq!(validate_dag(&workflow), Err(StructuralError::DuplicateNodeId(-1)));
    }

    #[test]
    fn link_referencing_missing_node_is_rejected() {
        let workflow = make_workflow(&[1], &[(1, 99)]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(StructuralError::UnknownNodeReference { node_id: 99, side: "child" })
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // 1 → 2 → 3 → 1
        let workflow = make_workflow(&[1, 2, 3], &[(1, 2), (2, 3), (3, 1)]);
        assert_eq!(validate_dag(&workflow), Err(StructuralError::CycleDetected));
    }

    #[test]
    fn insertion_between_ancestor_and_descendant_is_fine_but_reverse_is_not() {
        let mut wf = Workflow::new(1, "live", timestamp::now());
        for id in 1..=3 {
            wf.add_node(id, FwState::Waiting);
        }
        wf.add_link(1, 2);
        wf.add_link(2, 3);

        assert!(check_insertion(&wf, &[1], &[3]).is_ok());
        assert_eq!(
            check_insertion(&wf, &[3], &[1]),
            Err(StructuralError::InsertionCycle { parent: 3, child: 1 })
        );
        assert!(matches!(
            check_insertion(&wf, &[7], &[]),
            Err(StructuralError::UnknownNodeReference { node_id: 7, .. })
        ));
    }
}
