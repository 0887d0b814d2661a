//! Dependency graph over change steps: edge construction, deterministic
//! topological ordering, and cycle detection.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ActionType, ChangeStep};
use kusion_core::{Error, Result};

/// Edges and in-degrees over the union graph. An edge `from -> to`
/// means `from` must reach a terminal state before `to` starts.
pub(crate) struct DepGraph {
    pub indegree: BTreeMap<String, usize>,
    pub dependents: BTreeMap<String, Vec<String>>,
}

/// Build ordering edges from `DependsOn` references. For a resource `r`
/// depending on `d`, `d` runs first; when both sides are deletes the
/// edge flips so dependents are torn down before their dependencies.
pub(crate) fn build_graph(
    steps: &BTreeMap<String, ChangeStep>,
    deps: &BTreeMap<String, Vec<String>>,
) -> DepGraph {
    let mut indegree: BTreeMap<String, usize> =
        steps.keys().map(|id| (id.clone(), 0)).collect();
    let mut dependents: BTreeMap<String, Vec<String>> =
        steps.keys().map(|id| (id.clone(), Vec::new())).collect();

    for (id, targets) in deps {
        let Some(step) = steps.get(id) else { continue };
        for dep in targets {
            let Some(dep_step) = steps.get(dep) else { continue };
            let (from, to) = if step.action == ActionType::Delete
                && dep_step.action == ActionType::Delete
            {
                (id.clone(), dep.clone())
            } else {
                (dep.clone(), id.clone())
            };
            if let Some(entry) = dependents.get_mut(&from) {
                entry.push(to.clone());
            }
            if let Some(count) = indegree.get_mut(&to) {
                *count += 1;
            }
        }
    }
    DepGraph {
        indegree,
        dependents,
    }
}

/// Kahn's algorithm with a lexicographic ready set, so equal inputs
/// produce identical orderings. Unprocessed leftovers mean a cycle.
pub(crate) fn execution_order(
    steps: &BTreeMap<String, ChangeStep>,
    deps: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let DepGraph {
        mut indegree,
        dependents,
    } = build_graph(steps, deps);

    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = ready.iter().next().cloned() {
        ready.remove(&id);
        if let Some(next) = dependents.get(&id) {
            for dependent in next {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.clone());
                    }
                }
            }
        }
        order.push(id);
    }

    if order.len() < steps.len() {
        let remaining: BTreeSet<&String> = indegree
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(Error::CyclicDependency(find_cycle(&dependents, &remaining)));
    }
    Ok(order)
}

/// Walk the unprocessed subgraph until a node repeats, rendering the
/// cycle as `a -> b -> a`.
fn find_cycle(
    dependents: &BTreeMap<String, Vec<String>>,
    remaining: &BTreeSet<&String>,
) -> String {
    let Some(start) = remaining.iter().next() else {
        return String::new();
    };
    let mut path: Vec<&String> = vec![start];
    let mut seen: BTreeSet<&String> = BTreeSet::new();
    seen.insert(start);
    let mut current = *start;
    loop {
        let next = dependents
            .get(current)
            .and_then(|edges| edges.iter().find(|e| remaining.contains(e)));
        let Some(next) = next else {
            break;
        };
        if seen.contains(next) {
            path.push(next);
            let cycle_start = path.iter().position(|p| *p == next).unwrap_or(0);
            return path[cycle_start..]
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
        seen.insert(next);
        path.push(next);
        current = next;
    }
    path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" -> ")
}
