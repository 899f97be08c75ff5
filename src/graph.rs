use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patch::PatchDefinition;

/// Fatal, pre-execution graph problems. A run must not start when the
/// declared patch set fails to resolve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("patch '{patch}' depends on unknown patch '{dependency}'")]
    UnknownDependency { patch: String, dependency: String },
    #[error("duplicate patch id '{0}'")]
    DuplicateId(String),
    #[error("dependency cycle involving: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Advisory placement information for one patch.
///
/// `earliest_index` is the position immediately after the last of the
/// patch's transitive dependencies in declared order. The resolver only
/// reports; it never reorders the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchPlacement {
    pub patch_id: String,
    pub declared_index: usize,
    pub earliest_index: usize,
    pub can_run_earlier: bool,
}

/// Dependency graph over a declared patch set.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index_by_id: HashMap<String, usize>,
    /// Edges dependency -> dependents, by declared index.
    dependents: Vec<Vec<usize>>,
    /// Direct dependencies, by declared index.
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate the graph. Unknown ids, duplicate ids and
    /// cycles are configuration errors and fail fast.
    pub fn build(patches: &[PatchDefinition]) -> Result<Self, GraphError> {
        let mut index_by_id = HashMap::with_capacity(patches.len());
        for (index, patch) in patches.iter().enumerate() {
            if index_by_id.insert(patch.id.clone(), index).is_some() {
                return Err(GraphError::DuplicateId(patch.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); patches.len()];
        let mut dependents = vec![Vec::new(); patches.len()];
        for (index, patch) in patches.iter().enumerate() {
            for dep in &patch.dependencies {
                let dep_index =
                    *index_by_id
                        .get(dep)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            patch: patch.id.clone(),
                            dependency: dep.clone(),
                        })?;
                dependencies[index].push(dep_index);
                dependents[dep_index].push(index);
            }
        }

        let graph = Self {
            ids: patches.iter().map(|p| p.id.clone()).collect(),
            index_by_id,
            dependents,
            dependencies,
        };
        graph.check_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn declared_index(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    /// Depth-first cycle detection with an explicit recursion stack so
    /// the offending ids can be reported in path order.
    fn check_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut stack: Vec<usize> = Vec::new();

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), GraphError> {
            marks[node] = Mark::InProgress;
            stack.push(node);
            for &dep in &graph.dependencies[node] {
                match marks[dep] {
                    Mark::Done => {}
                    Mark::Unvisited => visit(graph, dep, marks, stack)?,
                    Mark::InProgress => {
                        let start = stack
                            .iter()
                            .position(|&n| n == dep)
                            .unwrap_or(stack.len() - 1);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|&n| graph.ids[n].clone()).collect();
                        cycle.push(graph.ids[dep].clone());
                        return Err(GraphError::Cycle(cycle));
                    }
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            Ok(())
        }

        for node in 0..self.ids.len() {
            if marks[node] == Mark::Unvisited {
                visit(self, node, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Total execution order consistent with every dependency edge.
    ///
    /// Stable: among patches with no relative constraint the declared
    /// order wins (ties break by original index, never by id), so the
    /// `phase.step` numbering conventions survive resolution.
    pub fn execution_order(&self) -> Vec<String> {
        let mut remaining: Vec<usize> = self
            .dependencies
            .iter()
            .map(|deps| deps.len())
            .collect();
        let mut emitted = vec![false; self.ids.len()];
        let mut order = Vec::with_capacity(self.ids.len());

        while order.len() < self.ids.len() {
            let next = (0..self.ids.len())
                .find(|&i| !emitted[i] && remaining[i] == 0)
                .expect("acyclic graph always has a ready patch");
            emitted[next] = true;
            order.push(self.ids[next].clone());
            for &dependent in &self.dependents[next] {
                remaining[dependent] -= 1;
            }
        }

        order
    }

    /// All transitive dependencies of a patch, by declared index.
    fn transitive_dependencies(&self, index: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut pending = self.dependencies[index].clone();
        while let Some(dep) = pending.pop() {
            if seen.insert(dep) {
                pending.extend(self.dependencies[dep].iter().copied());
            }
        }
        seen
    }

    /// The earliest position this patch could occupy given only its
    /// dependency constraints: one past the last transitive dependency
    /// in declared order, or 0 with no dependencies.
    pub fn earliest_feasible_index(&self, id: &str) -> Option<usize> {
        let index = self.declared_index(id)?;
        let earliest = self
            .transitive_dependencies(index)
            .into_iter()
            .max()
            .map(|max_dep| max_dep + 1)
            .unwrap_or(0);
        Some(earliest)
    }

    /// Advisory placement report for the whole set, in declared order.
    pub fn placement_report(&self) -> Vec<PatchPlacement> {
        self.ids
            .iter()
            .enumerate()
            .map(|(declared_index, id)| {
                let earliest_index = self
                    .earliest_feasible_index(id)
                    .expect("id comes from the graph");
                PatchPlacement {
                    patch_id: id.clone(),
                    declared_index,
                    earliest_index,
                    can_run_earlier: earliest_index < declared_index,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(id: &str, deps: &[&str]) -> PatchDefinition {
        PatchDefinition {
            id: id.to_string(),
            name: String::new(),
            step: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn diamond_orders_dependencies_first() {
        let patches = vec![
            patch("A", &[]),
            patch("B", &["A"]),
            patch("C", &["A"]),
            patch("D", &["B", "C"]),
        ];
        let graph = DependencyGraph::build(&patches).unwrap();
        assert_eq!(graph.execution_order(), vec!["A", "B", "C", "D"]);
        assert_eq!(graph.earliest_feasible_index("D"), Some(3));
        assert_eq!(graph.earliest_feasible_index("A"), Some(0));
        assert_eq!(graph.earliest_feasible_index("C"), Some(1));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let patches = vec![patch("A", &["missing"])];
        let err = DependencyGraph::build(&patches).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                patch: "A".into(),
                dependency: "missing".into(),
            }
        );
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let patches = vec![patch("A", &[]), patch("A", &[])];
        assert_eq!(
            DependencyGraph::build(&patches).unwrap_err(),
            GraphError::DuplicateId("A".into())
        );
    }

    #[test]
    fn cycle_is_reported_with_offending_ids() {
        let patches = vec![patch("A", &["C"]), patch("B", &["A"]), patch("C", &["B"])];
        match DependencyGraph::build(&patches).unwrap_err() {
            GraphError::Cycle(ids) => {
                assert!(ids.len() >= 3, "cycle path too short: {ids:?}");
                assert_eq!(ids.first(), ids.last());
                for id in ["A", "B", "C"] {
                    assert!(ids.contains(&id.to_string()), "missing {id} in {ids:?}");
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let patches = vec![patch("A", &["A"])];
        assert!(matches!(
            DependencyGraph::build(&patches).unwrap_err(),
            GraphError::Cycle(_)
        ));
    }

    #[test]
    fn ties_break_by_declared_order_not_id() {
        // "z" is declared before "a"; with no constraint between them the
        // declared order must survive.
        let patches = vec![patch("z", &[]), patch("a", &[]), patch("m", &["z", "a"])];
        let graph = DependencyGraph::build(&patches).unwrap();
        assert_eq!(graph.execution_order(), vec!["z", "a", "m"]);
    }

    #[test]
    fn phase0_chain_cannot_run_earlier() {
        // The P0.3.1 analysis case: every patch in a linear chain sits at
        // its earliest feasible position.
        let ids = [
            "v1.4.100(P0.1.0)",
            "v1.4.101(P0.1.1)",
            "v1.4.110(P0.2.0)",
            "v1.4.111(P0.2.1)",
            "v1.4.112(P0.2.2)",
            "v1.4.120(P0.3.0)",
            "v1.4.121(P0.3.1)",
        ];
        let patches: Vec<PatchDefinition> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let deps: Vec<&str> = if i == 0 { vec![] } else { vec![ids[i - 1]] };
                patch(id, &deps)
            })
            .collect();
        let graph = DependencyGraph::build(&patches).unwrap();
        for placement in graph.placement_report() {
            assert_eq!(placement.earliest_index, placement.declared_index);
            assert!(!placement.can_run_earlier);
        }
    }

    #[test]
    fn sparse_dependencies_surface_earlier_slots() {
        // P0.3.1 depends on a subset of its predecessors; the declared
        // order still pins it at index 6 because P0.3.0 sits at index 5.
        let patches = vec![
            patch("v1.4.100(P0.1.0)", &[]),
            patch("v1.4.101(P0.1.1)", &["v1.4.100(P0.1.0)"]),
            patch("v1.4.110(P0.2.0)", &["v1.4.101(P0.1.1)"]),
            patch("v1.4.111(P0.2.1)", &["v1.4.110(P0.2.0)"]),
            patch("v1.4.112(P0.2.2)", &["v1.4.111(P0.2.1)"]),
            patch("v1.4.120(P0.3.0)", &["v1.4.112(P0.2.2)"]),
            patch(
                "v1.4.121(P0.3.1)",
                &[
                    "v1.4.100(P0.1.0)",
                    "v1.4.101(P0.1.1)",
                    "v1.4.110(P0.2.0)",
                    "v1.4.120(P0.3.0)",
                ],
            ),
        ];
        let graph = DependencyGraph::build(&patches).unwrap();
        assert_eq!(graph.earliest_feasible_index("v1.4.121(P0.3.1)"), Some(6));
        let report = graph.placement_report();
        assert!(!report[6].can_run_earlier);
    }
}
