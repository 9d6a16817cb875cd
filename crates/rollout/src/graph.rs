//! Dependency ordering for named units (phases, apps)

use crate::error::GraphError;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A named unit that may depend on sibling units by name
pub trait Dependent {
    fn name(&self) -> &str;
    fn depends_on(&self) -> &[String];
}

impl Dependent for (String, Vec<String>) {
    fn name(&self) -> &str {
        &self.0
    }

    fn depends_on(&self) -> &[String] {
        &self.1
    }
}

/// Index nodes by name, rejecting duplicates and dangling dependencies
fn index_nodes<T: Dependent>(nodes: &[T]) -> Result<HashMap<&str, usize>, GraphError> {
    let mut index = HashMap::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        if index.insert(node.name(), idx).is_some() {
            return Err(GraphError::DuplicateNode(node.name().to_string()));
        }
    }

    for node in nodes {
        if let Some(missing) = node.depends_on().iter().find(|d| !index.contains_key(d.as_str())) {
            return Err(GraphError::UnknownDependency {
                node: node.name().to_string(),
                dependency: missing.clone(),
            });
        }
    }
    Ok(index)
}

/// Dependency-respecting order, as indices into `nodes`
///
/// Kahn's algorithm, always taking the earliest-declared ready node, so the
/// result is deterministic and keeps declared order wherever the
/// dependencies allow it.
pub fn topological_order<T: Dependent>(nodes: &[T]) -> Result<Vec<usize>, GraphError> {
    let index = index_nodes(nodes)?;

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        // repeated names in depends_on count once
        let deps: BTreeSet<usize> = node.depends_on().iter().map(|d| index[d.as_str()]).collect();
        for dep in deps {
            indegree[idx] += 1;
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(idx) = ready.pop_first() {
        ordered.push(idx);
        for &child in &dependents[idx] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if ordered.len() != nodes.len() {
        return Err(GraphError::Cycle {
            path: find_cycle(nodes, &index, &indegree),
        });
    }
    Ok(ordered)
}

/// Walk dependency edges among the unresolved nodes until one repeats
///
/// Every node left with a non-zero indegree has a dependency that is also
/// unresolved, so the walk always closes a loop.
fn find_cycle<T: Dependent>(
    nodes: &[T],
    index: &HashMap<&str, usize>,
    indegree: &[usize],
) -> Vec<String> {
    let Some(start) = indegree.iter().position(|&d| d > 0) else {
        return Vec::new();
    };

    let mut trail: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = trail.iter().position(|&i| i == current) {
            let mut path: Vec<String> = trail[pos..]
                .iter()
                .map(|&i| nodes[i].name().to_string())
                .collect();
            path.push(nodes[current].name().to_string());
            return path;
        }
        trail.push(current);

        let next = nodes[current]
            .depends_on()
            .iter()
            .map(|d| index[d.as_str()])
            .find(|&i| indegree[i] > 0);
        match next {
            Some(next) => current = next,
            None => return trail.iter().map(|&i| nodes[i].name().to_string()).collect(),
        }
    }
}

/// Pending nodes whose dependencies have all run
///
/// `pending` is expected in topological order; the wave keeps that order.
pub fn ready_wave<T: Dependent>(nodes: &[T], pending: &[usize], done: &HashSet<String>) -> Vec<usize> {
    pending
        .iter()
        .copied()
        .filter(|&idx| nodes[idx].depends_on().iter().all(|d| done.contains(d)))
        .collect()
}

/// Group a whole graph into waves, as a parallel run would dispatch them
pub fn waves<T: Dependent>(nodes: &[T]) -> Result<Vec<Vec<usize>>, GraphError> {
    let mut pending = topological_order(nodes)?;
    let mut done = HashSet::new();
    let mut waves = Vec::new();

    while !pending.is_empty() {
        let wave = ready_wave(nodes, &pending, &done);
        if wave.is_empty() {
            break;
        }
        pending.retain(|idx| !wave.contains(idx));
        done.extend(wave.iter().map(|&idx| nodes[idx].name().to_string()));
        waves.push(wave);
    }
    Ok(waves)
}
