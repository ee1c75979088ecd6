//! Connected-component clustering of duplicate pairs

use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Disjoint-set forest with path compression and union by rank
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    /// True if `x` and `y` were in different sets
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return false;
        }

        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

/// Group file ids connected by pairs.
///
/// Only components with at least two members are returned. Members are
/// sorted and components are ordered by their smallest member, so the output
/// does not depend on pair order.
pub fn cluster_pairs(pairs: &[(Uuid, Uuid)]) -> Vec<Vec<Uuid>> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut ids: Vec<Uuid> = Vec::new();
    let mut edges = Vec::with_capacity(pairs.len());

    for &(a, b) in pairs {
        let mut slot = |id: Uuid| {
            *index.entry(id).or_insert_with(|| {
                ids.push(id);
                ids.len() - 1
            })
        };
        let (a, b) = (slot(a), slot(b));
        edges.push((a, b));
    }

    let mut uf = UnionFind::new(ids.len());
    for (a, b) in edges {
        uf.union(a, b);
    }

    let mut components: HashMap<usize, Vec<Uuid>> = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        components.entry(uf.find(i)).or_default().push(*id);
    }

    let mut groups: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for mut members in components.into_values().filter(|m| m.len() > 1) {
        members.sort();
        groups.insert(members[0], members);
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_union_find_basic() {
        let mut uf = UnionFind::new(4);
        assert!(uf.union(0, 1));
        assert!(uf.union(2, 3));
        assert!(!uf.union(1, 0));
        assert_eq!(uf.find(0), uf.find(1));
        assert_ne!(uf.find(0), uf.find(2));
        assert!(uf.union(1, 3));
        assert_eq!(uf.find(0), uf.find(2));
        assert_eq!(uf.len(), 4);
    }

    #[test]
    fn test_transitive_pairs_form_one_group() {
        let f = ids(5);
        let groups = cluster_pairs(&[(f[0], f[1]), (f[1], f[2]), (f[3], f[4])]);
        assert_eq!(groups, vec![vec![f[0], f[1], f[2]], vec![f[3], f[4]]]);
    }

    #[test]
    fn test_order_independent() {
        let f = ids(4);
        let forward = cluster_pairs(&[(f[0], f[1]), (f[2], f[3]), (f[1], f[2])]);
        let backward = cluster_pairs(&[(f[2], f[1]), (f[3], f[2]), (f[1], f[0])]);
        assert_eq!(forward, backward);
        assert!(cluster_pairs(&[]).is_empty());
    }
}
