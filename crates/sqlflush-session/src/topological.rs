//! Topological sorting with cycle grouping.
//!
//! [`TopologicalSorter`] orders arbitrary directed graphs. Strongly connected
//! components (including single nodes with a self-loop) are never broken by
//! the sorter; they are returned as [`Component::Cycle`] so the caller can
//! order their members with domain knowledge.
//!
//! The result is a forest over components: each weakly connected part of the
//! graph becomes one chain, so a depth-first walk (parent before children)
//! visits components in a valid topological order. Ties are broken by node
//! insertion order, which makes the output fully deterministic.
//!
//! All traversals are iterative; graph depth never grows the call stack.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;

/// One unit of the sorted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component<N> {
    /// A node that is not part of any cycle.
    Single(N),
    /// Mutually reachable nodes (or one node with a self-loop), in insertion
    /// order.
    Cycle(Vec<N>),
}

impl<N: Copy> Component<N> {
    /// Member nodes, in insertion order.
    pub fn nodes(&self) -> Vec<N> {
        match self {
            Component::Single(n) => vec![*n],
            Component::Cycle(nodes) => nodes.clone(),
        }
    }

    /// Whether this component is a cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Component::Cycle(_))
    }
}

/// Output of [`TopologicalSorter::sort`].
#[derive(Debug, Clone)]
pub struct SortResult<N> {
    components: Vec<Component<N>>,
    parents: Vec<Option<usize>>,
}

impl<N: Copy> SortResult<N> {
    /// Components in topological order.
    pub fn components(&self) -> &[Component<N>] {
        &self.components
    }

    /// Parent of a component in the forest, by position.
    pub fn parent(&self, index: usize) -> Option<usize> {
        self.parents.get(index).copied().flatten()
    }

    /// Positions of components without a parent.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.components.len())
            .filter(|&i| self.parents[i].is_none())
            .collect()
    }

    /// Positions of the children of a component.
    pub fn children(&self, index: usize) -> Vec<usize> {
        (0..self.components.len())
            .filter(|&i| self.parents[i] == Some(index))
            .collect()
    }

    /// The cyclic components.
    pub fn cycles(&self) -> Vec<&[N]> {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::Cycle(nodes) => Some(nodes.as_slice()),
                Component::Single(_) => None,
            })
            .collect()
    }

    /// Whether no component is a cycle.
    pub fn is_acyclic(&self) -> bool {
        !self.components.iter().any(Component::is_cycle)
    }

    /// All nodes, components flattened in order.
    pub fn flatten(&self) -> Vec<N> {
        self.components.iter().flat_map(Component::nodes).collect()
    }
}

/// Directed graph builder and sorter.
///
/// An edge `(a, b)` means `a` must be processed before `b`.
#[derive(Debug, Clone)]
pub struct TopologicalSorter<N> {
    nodes: Vec<N>,
    index: HashMap<N, usize>,
    edges: Vec<Vec<usize>>,
    edge_set: HashSet<(usize, usize)>,
}

const UNVISITED: usize = usize::MAX;

impl<N: Copy + Eq + Hash> TopologicalSorter<N> {
    /// Create a sorter over `nodes`; their order is the tie-breaking order.
    pub fn new(nodes: impl IntoIterator<Item = N>) -> Self {
        let mut sorter = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
        };
        for node in nodes {
            sorter.add_node(node);
        }
        sorter
    }

    /// Add a node if it is not present yet; returns its position.
    pub fn add_node(&mut self, node: N) -> usize {
        if let Some(&i) = self.index.get(&node) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(node, i);
        self.edges.push(Vec::new());
        i
    }

    /// Require `before` to precede `after`.
    ///
    /// Duplicate edges are ignored; unknown nodes are appended.
    pub fn add_edge(&mut self, before: N, after: N) {
        let a = self.add_node(before);
        let b = self.add_node(after);
        if self.edge_set.insert((a, b)) {
            self.edges[a].push(b);
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sort the graph.
    #[tracing::instrument(level = "trace", skip(self), fields(nodes = self.nodes.len(), edges = self.edge_set.len()))]
    pub fn sort(&self) -> SortResult<N> {
        let sccs = self.strongly_connected();

        let mut comp_of = vec![0; self.nodes.len()];
        for (c, members) in sccs.iter().enumerate() {
            for &v in members {
                comp_of[v] = c;
            }
        }

        // Condensation graph.
        let mut succ: Vec<Vec<usize>> = vec![Vec::new(); sccs.len()];
        let mut indegree = vec![0usize; sccs.len()];
        let mut seen = HashSet::new();
        for (a, targets) in self.edges.iter().enumerate() {
            for &b in targets {
                let (ca, cb) = (comp_of[a], comp_of[b]);
                if ca != cb && seen.insert((ca, cb)) {
                    succ[ca].push(cb);
                    indegree[cb] += 1;
                }
            }
        }

        // Kahn's algorithm; the smallest member position goes first.
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(c, _)| Reverse((sccs[c][0], c)))
            .collect();
        let mut order = Vec::with_capacity(sccs.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            order.push(c);
            for &next in &succ[c] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((sccs[next][0], next)));
                }
            }
        }

        // One chain per weakly connected part.
        let mut uf = UnionFind::new(sccs.len());
        for (a, targets) in succ.iter().enumerate() {
            for &b in targets {
                uf.union(a, b);
            }
        }
        let mut last_in_group: HashMap<usize, usize> = HashMap::new();
        let mut parents = Vec::with_capacity(order.len());
        for (pos, &c) in order.iter().enumerate() {
            let group = uf.find(c);
            parents.push(last_in_group.insert(group, pos));
        }

        let components = order
            .iter()
            .map(|&c| {
                let members = &sccs[c];
                let cyclic = members.len() > 1 || self.edge_set.contains(&(members[0], members[0]));
                if cyclic {
                    Component::Cycle(members.iter().map(|&v| self.nodes[v]).collect())
                } else {
                    Component::Single(self.nodes[members[0]])
                }
            })
            .collect();

        SortResult {
            components,
            parents,
        }
    }

    /// Tarjan's algorithm, iterative. Members of each component are sorted by
    /// position.
    fn strongly_connected(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut next = 0usize;
        let mut components = Vec::new();

        for start in 0..n {
            if index[start] != UNVISITED {
                continue;
            }
            index[start] = next;
            low[start] = next;
            next += 1;
            stack.push(start);
            on_stack[start] = true;
            let mut work = vec![(start, 0usize)];

            while let Some(frame) = work.last_mut() {
                let (v, pos) = *frame;
                if let Some(&w) = self.edges[v].get(pos) {
                    frame.1 += 1;
                    if index[w] == UNVISITED {
                        index[w] = next;
                        low[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        work.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(index[w]);
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    low[parent] = low[parent].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut members = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        members.push(w);
                        if w == v {
                            break;
                        }
                    }
                    members.sort_unstable();
                    components.push(members);
                }
            }
        }
        components
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[char], n: char) -> usize {
        order.iter().position(|&x| x == n).unwrap()
    }

    #[test]
    fn respects_edges() {
        let mut s = TopologicalSorter::new(['c', 'b', 'a']);
        s.add_edge('a', 'b');
        s.add_edge('b', 'c');
        let result = s.sort();

        assert!(result.is_acyclic());
        assert_eq!(result.flatten(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn unconnected_nodes_keep_insertion_order() {
        let s = TopologicalSorter::new([3, 1, 2]);
        let result = s.sort();
        assert_eq!(result.flatten(), vec![3, 1, 2]);
        assert_eq!(result.roots(), vec![0, 1, 2]);
    }

    #[test]
    fn chains_per_connected_part() {
        let mut s = TopologicalSorter::new(['a', 'b', 'x', 'y']);
        s.add_edge('a', 'b');
        s.add_edge('x', 'y');
        let result = s.sort();

        let order = result.flatten();
        assert!(position(&order, 'a') < position(&order, 'b'));
        assert!(position(&order, 'x') < position(&order, 'y'));
        assert_eq!(result.roots().len(), 2);
        for root in result.roots() {
            assert_eq!(result.children(root).len(), 1);
        }
    }

    #[test]
    fn groups_cycles() {
        let mut s = TopologicalSorter::new(['p', 'a', 'b', 'z']);
        s.add_edge('p', 'a');
        s.add_edge('a', 'b');
        s.add_edge('b', 'a');
        s.add_edge('b', 'z');
        let result = s.sort();

        assert!(!result.is_acyclic());
        assert_eq!(result.cycles(), vec![&['a', 'b'][..]]);
        let kinds: Vec<bool> = result.components().iter().map(Component::is_cycle).collect();
        assert_eq!(kinds, vec![false, true, false]);
        assert_eq!(result.flatten(), vec!['p', 'a', 'b', 'z']);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut s = TopologicalSorter::new(["Node"]);
        s.add_edge("Node", "Node");
        let result = s.sort();
        assert_eq!(result.components(), &[Component::Cycle(vec!["Node"])]);
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let mut s = TopologicalSorter::new([1, 2]);
        s.add_edge(2, 1);
        s.add_edge(2, 1);
        assert_eq!(s.sort().flatten(), vec![2, 1]);
    }

    #[test]
    fn long_chain_does_not_recurse() {
        let n = 50_000u32;
        let mut s = TopologicalSorter::new((0..n).rev());
        for i in 0..n - 1 {
            s.add_edge(i, i + 1);
        }
        let order = s.sort().flatten();
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&(n - 1)));
    }
}
