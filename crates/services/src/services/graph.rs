use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use sqlx::PgPool;
use ts_rs::TS;
use uuid::Uuid;

use db::models::{
    dependency_edge::{DependencyEdge, DependencyType},
    task::{Task, TaskPriority},
};

/// Node payload for the dependency graph view.
#[derive(Debug, Clone, Serialize, TS)]
pub struct GraphNode {
    pub id: Uuid,
    pub title: String,
    pub status: String,
    pub priority: TaskPriority,
    pub assigned_agent: Option<String>,
    pub estimated_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<DependencyEdge>,
    pub critical_path: Vec<Uuid>,
    pub topological_order: Vec<Uuid>,
}

/// Would adding edge (from → to) close a cycle over `edges`?
///
/// DFS from `to`: if `from` is reachable the edge is rejected. Returns the
/// offending path ordered from the proposed edge's source, so callers can
/// render a readable "B → A" style message.
pub fn detect_cycle(edges: &[(Uuid, Uuid)], from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (src, dst) in edges {
        adj.entry(*src).or_default().push(*dst);
    }
    adj.entry(from).or_default().push(to);

    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut path: Vec<Uuid> = Vec::new();

    fn dfs(
        node: Uuid,
        target: Uuid,
        adj: &HashMap<Uuid, Vec<Uuid>>,
        visited: &mut HashSet<Uuid>,
        path: &mut Vec<Uuid>,
    ) -> bool {
        if node == target {
            path.push(node);
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        for &next in adj.get(&node).map(Vec::as_slice).unwrap_or_default() {
            if dfs(next, target, adj, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    if dfs(to, from, &adj, &mut visited, &mut path) {
        path.reverse();
        Some(path)
    } else {
        None
    }
}

/// Kahn's algorithm over the `blocks` sub-graph. Ties are broken by priority
/// then id so the order is deterministic. Returns None if the graph has a
/// cycle (fewer sorted nodes than inputs).
pub fn topological_order(
    ids: &[Uuid],
    priorities: &HashMap<Uuid, TaskPriority>,
    edges: &[(Uuid, Uuid)],
) -> Option<Vec<Uuid>> {
    let id_set: HashSet<Uuid> = ids.iter().copied().collect();
    let mut in_degree: HashMap<Uuid, usize> = ids.iter().map(|&id| (id, 0)).collect();
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        if id_set.contains(from) && id_set.contains(to) {
            adj.entry(*from).or_default().push(*to);
            *in_degree.entry(*to).or_default() += 1;
        }
    }

    let mut queue: Vec<Uuid> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut sorted = Vec::with_capacity(ids.len());

    while !queue.is_empty() {
        queue.sort_by_key(|id| (priorities.get(id).copied().unwrap_or_default(), *id));
        let node = queue.remove(0);
        sorted.push(node);
        for &next in adj.get(&node).map(Vec::as_slice).unwrap_or_default() {
            let deg = in_degree.get_mut(&next).expect("edge endpoint in id set");
            *deg -= 1;
            if *deg == 0 {
                queue.push(next);
            }
        }
    }

    (sorted.len() == ids.len()).then_some(sorted)
}

/// Whether the proposed edge set over `ids` contains a cycle. Used by bulk
/// import to validate the combined graph before any row is inserted.
pub fn has_cycle(ids: &[Uuid], edges: &[(Uuid, Uuid)]) -> bool {
    let mut in_degree: HashMap<Uuid, usize> = ids.iter().map(|&id| (id, 0)).collect();
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        adj.entry(*from).or_default().push(*to);
        *in_degree.entry(*to).or_default() += 1;
    }

    let mut queue: VecDeque<Uuid> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut seen = 0usize;
    while let Some(node) = queue.pop_front() {
        seen += 1;
        for &next in adj.get(&node).map(Vec::as_slice).unwrap_or_default() {
            let deg = in_degree.get_mut(&next).expect("edge endpoint in id set");
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(next);
            }
        }
    }
    seen != ids.len()
}

/// Longest path through the `blocks` sub-graph, weighted by estimated hours
/// (missing estimates count as 1). Returns the chain traced back from the
/// max-distance node.
pub fn critical_path(
    topo: &[Uuid],
    weights: &HashMap<Uuid, f64>,
    edges: &[(Uuid, Uuid)],
) -> Vec<Uuid> {
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        adj.entry(*from).or_default().push(*to);
    }

    let mut dist: HashMap<Uuid, f64> = topo.iter().map(|&id| (id, 0.0)).collect();
    let mut prev: HashMap<Uuid, Option<Uuid>> = topo.iter().map(|&id| (id, None)).collect();

    for &node in topo {
        let base = dist[&node];
        for &next in adj.get(&node).map(Vec::as_slice).unwrap_or_default() {
            let hours = weights.get(&next).copied().unwrap_or(1.0);
            if base + hours > dist[&next] {
                dist.insert(next, base + hours);
                prev.insert(next, Some(node));
            }
        }
    }

    let Some((&max_node, _)) = dist
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return Vec::new();
    };

    let mut path = vec![max_node];
    let mut current = max_node;
    while let Some(Some(p)) = prev.get(&current) {
        path.push(*p);
        current = *p;
    }
    path.reverse();
    path
}

/// Assemble the full graph view for a project: nodes, edges, topological
/// order and critical path.
pub async fn snapshot(pool: &PgPool, project_id: Uuid) -> Result<GraphSnapshot, sqlx::Error> {
    let tasks = Task::find_by_project(pool, project_id).await?;
    let edges = DependencyEdge::find_by_project(pool, project_id).await?;

    let nodes: Vec<GraphNode> = tasks
        .iter()
        .map(|t| GraphNode {
            id: t.id,
            title: t.title.clone(),
            status: t.status.clone(),
            priority: t.priority,
            assigned_agent: t.assigned_agent.clone(),
            estimated_hours: t.estimated_hours,
        })
        .collect();

    let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
    let priorities: HashMap<Uuid, TaskPriority> = tasks.iter().map(|t| (t.id, t.priority)).collect();
    let weights: HashMap<Uuid, f64> = tasks
        .iter()
        .map(|t| (t.id, t.estimated_hours.unwrap_or(1.0)))
        .collect();
    let blocking: Vec<(Uuid, Uuid)> = edges
        .iter()
        .filter(|e| e.edge_type == DependencyType::Blocks)
        .map(|e| (e.from_task_id, e.to_task_id))
        .collect();

    // The blocks sub-graph is a DAG by construction (every insert is
    // cycle-checked), so the sort always succeeds; fall back to insertion
    // order if an inconsistent graph sneaks in.
    let topo = topological_order(&ids, &priorities, &blocking).unwrap_or_else(|| ids.clone());
    let critical = critical_path(&topo, &weights, &blocking);

    Ok(GraphSnapshot {
        nodes,
        edges,
        critical_path: critical,
        topological_order: topo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn detect_cycle_rejects_direct_back_edge() {
        // A→B exists; adding B→A must report the cycle as "B → A".
        let a = uid(1);
        let b = uid(2);
        let path = detect_cycle(&[(a, b)], b, a).expect("cycle expected");
        assert_eq!(path, vec![b, a]);
    }

    #[test]
    fn detect_cycle_finds_transitive_cycles() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        // a→b→c exists; c→a closes the loop.
        assert!(detect_cycle(&[(a, b), (b, c)], c, a).is_some());
        // c→b is fine (diamond, not cycle).
        assert!(detect_cycle(&[(a, b), (a, c)], c, b).is_none());
    }

    #[test]
    fn detect_cycle_allows_disjoint_edges() {
        let (a, b, c, d) = (uid(1), uid(2), uid(3), uid(4));
        assert!(detect_cycle(&[(a, b)], c, d).is_none());
    }

    #[test]
    fn topo_orders_dependencies_first() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        let priorities = HashMap::new();
        let order = topological_order(&[c, b, a], &priorities, &[(a, b), (b, c)]).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn topo_breaks_ties_by_priority() {
        let (a, b) = (uid(1), uid(2));
        let mut priorities = HashMap::new();
        priorities.insert(a, TaskPriority::P3);
        priorities.insert(b, TaskPriority::P0);
        let order = topological_order(&[a, b], &priorities, &[]).unwrap();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn topo_returns_none_on_cycle() {
        let (a, b) = (uid(1), uid(2));
        assert!(topological_order(&[a, b], &HashMap::new(), &[(a, b), (b, a)]).is_none());
    }

    #[test]
    fn has_cycle_on_combined_import_graph() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        assert!(has_cycle(&[a, b, c], &[(a, b), (b, c), (c, a)]));
        assert!(!has_cycle(&[a, b, c], &[(a, b), (b, c)]));
        assert!(!has_cycle(&[], &[]));
    }

    #[test]
    fn critical_path_follows_heaviest_chain() {
        let (a, b, c, d) = (uid(1), uid(2), uid(3), uid(4));
        // a→b→d (weights 5+5) vs a→c→d where c weighs 20.
        let edges = vec![(a, b), (b, d), (a, c), (c, d)];
        let mut weights = HashMap::new();
        weights.insert(a, 1.0);
        weights.insert(b, 5.0);
        weights.insert(c, 20.0);
        weights.insert(d, 5.0);
        let topo = topological_order(&[a, b, c, d], &HashMap::new(), &edges).unwrap();
        let path = critical_path(&topo, &weights, &edges);
        assert_eq!(path, vec![a, c, d]);
    }

    #[test]
    fn critical_path_on_isolated_nodes_is_single_node() {
        let a = uid(1);
        let path = critical_path(&[a], &HashMap::from([(a, 2.0)]), &[]);
        assert_eq!(path, vec![a]);
    }
}
