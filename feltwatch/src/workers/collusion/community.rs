// feltwatch/src/workers/collusion/community.rs
//
// Community detection over a snapshot of strong edges.
//
//   louvain               weighted modularity local-moving: each node moves to
//                         the neighboring community with the best ΔQ until a
//                         pass makes no move (or the pass cap is hit)
//   connected_components  BFS over the same edges
//
// Both work on an owned snapshot, never on the live graph, and poll the
// context between passes so a cancelled sweep returns without side effects.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::context::Context;
use crate::error::Result;
use crate::workers::collusion::graph::StrongEdge;

/// Dense adjacency built from a strong-edge snapshot.
struct Snapshot {
    names: Vec<String>,
    adj: Vec<Vec<(usize, f64)>>,
    degree: Vec<f64>,
    total_weight: f64,
}

impl Snapshot {
    fn build(edges: &[StrongEdge]) -> Self {
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for e in edges {
            index.entry(e.a.as_str()).or_insert(0);
            index.entry(e.b.as_str()).or_insert(0);
        }
        // Sorted names give a deterministic visiting order.
        let names: Vec<String> = index.keys().map(|s| s.to_string()).collect();
        for (i, v) in index.values_mut().enumerate() {
            *v = i;
        }
        let mut adj = vec![Vec::new(); names.len()];
        let mut degree = vec![0.0; names.len()];
        let mut total_weight = 0.0;
        for e in edges {
            let (i, j) = (index[e.a.as_str()], index[e.b.as_str()]);
            if i == j {
                continue;
            }
            adj[i].push((j, e.weight));
            adj[j].push((i, e.weight));
            degree[i] += e.weight;
            degree[j] += e.weight;
            total_weight += e.weight;
        }
        Self { names, adj, degree, total_weight }
    }

    fn groups(&self, label: &[usize]) -> Vec<Vec<String>> {
        let mut by_label: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (i, &l) in label.iter().enumerate() {
            by_label.entry(l).or_default().push(self.names[i].clone());
        }
        let mut out: Vec<Vec<String>> = by_label.into_values().filter(|g| g.len() >= 2).collect();
        for g in &mut out {
            g.sort();
        }
        out.sort();
        out
    }
}

pub fn louvain(ctx: &Context, edges: &[StrongEdge], max_passes: u32) -> Result<Vec<Vec<String>>> {
    let snap = Snapshot::build(edges);
    let n = snap.names.len();
    if n == 0 || snap.total_weight <= 0.0 {
        return Ok(Vec::new());
    }
    let m2 = 2.0 * snap.total_weight;
    let mut community: Vec<usize> = (0..n).collect();
    let mut tot: Vec<f64> = snap.degree.clone();

    for _pass in 0..max_passes.max(1) {
        ctx.check()?;
        let mut moved = false;
        for node in 0..n {
            if node % 256 == 0 {
                ctx.check()?;
            }
            let current = community[node];
            let k = snap.degree[node];

            let mut links: HashMap<usize, f64> = HashMap::new();
            for &(nb, w) in &snap.adj[node] {
                *links.entry(community[nb]).or_insert(0.0) += w;
            }

            // Take the node out, then find the best home (ties → lowest id).
            tot[current] -= k;
            let gain = |c: usize, to_c: f64| to_c - tot[c] * k / m2;
            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            let mut candidates: Vec<(usize, f64)> = links.iter().map(|(&c, &w)| (c, w)).collect();
            candidates.sort_by_key(|&(c, _)| c);
            for (c, to_c) in candidates {
                let g = gain(c, to_c);
                if g > best_gain + 1e-12 || ((g - best_gain).abs() <= 1e-12 && c < best) {
                    best = c;
                    best_gain = g;
                }
            }
            tot[best] += k;
            if best != current {
                community[node] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    Ok(snap.groups(&community))
}

pub fn connected_components(ctx: &Context, edges: &[StrongEdge]) -> Result<Vec<Vec<String>>> {
    let snap = Snapshot::build(edges);
    let n = snap.names.len();
    let mut label = vec![usize::MAX; n];
    for start in 0..n {
        if label[start] != usize::MAX {
            continue;
        }
        ctx.check()?;
        label[start] = start;
        let mut queue = VecDeque::from([start]);
        while let Some(u) = queue.pop_front() {
            for &(v, _) in &snap.adj[u] {
                if label[v] == usize::MAX {
                    label[v] = start;
                    queue.push_back(v);
                }
            }
        }
    }
    Ok(snap.groups(&label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::cancellable;
    use crate::error::FraudError;

    fn e(a: &str, b: &str, w: f64) -> StrongEdge {
        StrongEdge { a: a.into(), b: b.into(), weight: w, hands: w as u64 }
    }

    /// Two triangles joined by one weak bridge.
    fn two_cliques() -> Vec<StrongEdge> {
        vec![
            e("a1", "a2", 50.0),
            e("a1", "a3", 50.0),
            e("a2", "a3", 50.0),
            e("b1", "b2", 50.0),
            e("b1", "b3", 50.0),
            e("b2", "b3", 50.0),
            e("a3", "b1", 5.0),
        ]
    }

    #[test]
    fn louvain_separates_cliques() {
        let groups = louvain(&Context::background(), &two_cliques(), 20).unwrap();
        assert_eq!(groups, vec![vec!["a1", "a2", "a3"], vec!["b1", "b2", "b3"]]);
    }

    #[test]
    fn components_merge_bridged_cliques() {
        let groups = connected_components(&Context::background(), &two_cliques()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 6);
    }

    #[test]
    fn cancelled_context_aborts() {
        let (handle, ctx) = cancellable();
        handle.cancel();
        assert!(matches!(louvain(&ctx, &two_cliques(), 20), Err(FraudError::Cancelled)));
        assert!(matches!(connected_components(&ctx, &two_cliques()), Err(FraudError::Cancelled)));
    }

    #[test]
    fn empty_snapshot_yields_nothing() {
        assert!(louvain(&Context::background(), &[], 5).unwrap().is_empty());
    }
}
