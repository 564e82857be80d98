//! Dependency resolution and topological ordering.
//!
//! The DAG is kept as index arrays over the step list: `depends_on` names
//! resolve through a name → positions multimap built once per call, and an
//! edge is added from every *other* step whose tool name matches. A cycle
//! falls back to the original plan order; the wave scheduler then reports
//! the unsatisfiable remainder as `blocked`.

use std::collections::{HashMap, VecDeque};

use super::step::Step;

/// `deps[i]` = positions of the steps that must complete before step `i`.
pub fn dependency_edges(steps: &[Step]) -> Vec<Vec<usize>> {
    let mut by_tool: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        by_tool.entry(step.tool.as_str()).or_default().push(i);
    }
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut deps = Vec::new();
            for name in step.deps() {
                if let Some(positions) = by_tool.get(name.as_str()) {
                    deps.extend(positions.iter().copied().filter(|&j| j != i));
                }
            }
            deps.sort_unstable();
            deps.dedup();
            deps
        })
        .collect()
}

/// Kahn's algorithm; on a cycle the original order is returned unchanged.
pub fn toposort(steps: &[Step]) -> Vec<usize> {
    let deps = dependency_edges(steps);
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, dep_list) in deps.iter().enumerate() {
        for &j in dep_list {
            dependents[j].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &v in &dependents[i] {
            indegree[v] -= 1;
            if indegree[v] == 0 {
                queue.push_back(v);
            }
        }
    }

    if order.len() == steps.len() {
        order
    } else {
        (0..steps.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::executor::step::parse_steps;

    fn steps(raw: &[serde_json::Value]) -> Vec<Step> {
        parse_steps(raw).unwrap()
    }

    #[test]
    fn independent_steps_keep_order() {
        let s = steps(&[json!({"tool": "a"}), json!({"tool": "b"})]);
        assert_eq!(toposort(&s), vec![0, 1]);
        assert_eq!(dependency_edges(&s), vec![Vec::<usize>::new(), Vec::<usize>::new()]);
    }

    #[test]
    fn dependency_orders_before_dependent() {
        let s = steps(&[
            json!({"tool": "b", "depends_on": ["a"]}),
            json!({"tool": "a"}),
        ]);
        let order = toposort(&s);
        let pos_a = order.iter().position(|&i| s[i].tool == "a").unwrap();
        let pos_b = order.iter().position(|&i| s[i].tool == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn name_matching_multiple_upstreams_means_all() {
        let s = steps(&[
            json!({"tool": "fetch"}),
            json!({"tool": "fetch"}),
            json!({"tool": "merge", "depends_on": ["fetch"]}),
        ]);
        assert_eq!(dependency_edges(&s)[2], vec![0, 1]);
    }

    #[test]
    fn unknown_dependency_is_noop() {
        let s = steps(&[json!({"tool": "a", "depends_on": ["ghost"]})]);
        assert_eq!(dependency_edges(&s)[0], Vec::<usize>::new());
        assert_eq!(toposort(&s), vec![0]);
    }

    #[test]
    fn self_dependency_adds_no_edge() {
        let s = steps(&[json!({"tool": "a", "depends_on": ["a"]})]);
        assert_eq!(dependency_edges(&s)[0], Vec::<usize>::new());
    }

    #[test]
    fn cycle_falls_back_to_original_order() {
        let s = steps(&[
            json!({"tool": "a", "depends_on": ["b"]}),
            json!({"tool": "b", "depends_on": ["a"]}),
            json!({"tool": "c"}),
        ]);
        assert_eq!(toposort(&s), vec![0, 1, 2]);
    }

    #[test]
    fn diamond_resolves() {
        let s = steps(&[
            json!({"tool": "d", "depends_on": ["b", "c"]}),
            json!({"tool": "b", "depends_on": ["a"]}),
            json!({"tool": "c", "depends_on": ["a"]}),
            json!({"tool": "a"}),
        ]);
        let order = toposort(&s);
        let pos = |name: &str| order.iter().position(|&i| s[i].tool == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}
