use std::fmt;

use petgraph::{
    dot::Dot,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        heap::{ClientHeap, WORD},
        Chunk,
    },
    shadow::ShadowMap,
    util::num::round_up,
    Addr,
};

/// Where in its target a pointer lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerKind {
    /// Exactly at the base.
    Start,
    /// Somewhere past the base.
    Interior,
}

impl fmt::Display for PointerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerKind::Start => f.write_str("start"),
            PointerKind::Interior => f.write_str("interior"),
        }
    }
}

/// Which chunk seems to point at which.
///
/// "Seems", because we have no type information: any aligned word inside a
/// chunk whose value falls within another chunk counts as a pointer to it.
/// Words that touch no-access bytes are never read.
#[derive(Debug)]
pub struct PointsToGraph {
    graph: DiGraph<Chunk, PointerKind>,
    /// `(base, node)`, sorted by base.
    by_base: Vec<(Addr, NodeIndex)>,
}

impl PointsToGraph {
    /// Build the graph over `chunks`, reading their contents from `heap`.
    pub fn build<'a, I, H>(chunks: I, shadow: &ShadowMap, heap: &H) -> Self
    where
        I: IntoIterator<Item = &'a Chunk>,
        H: ClientHeap + ?Sized,
    {
        let mut graph = DiGraph::new();
        let mut by_base: Vec<(Addr, NodeIndex)> = chunks
            .into_iter()
            .map(|chunk| (chunk.base, graph.add_node(chunk.clone())))
            .collect();
        by_base.sort_unstable_by_key(|&(base, _)| base);

        let mut this = Self { graph, by_base };
        let nodes: Vec<NodeIndex> = this.graph.node_indices().collect();
        for node in nodes {
            for (target, kind) in this.find_pointers(node, shadow, heap) {
                this.add_pointer(node, target, kind);
            }
        }
        this
    }

    /// The chunk `value` points into, if any.
    pub fn lookup(&self, value: usize) -> Option<(NodeIndex, PointerKind)> {
        let after = self.by_base.partition_point(|&(base, _)| base <= value);
        let &(base, node) = self.by_base.get(after.checked_sub(1)?)?;
        if !self.graph[node].contains(value) {
            return None;
        }
        let kind = if value == base {
            PointerKind::Start
        } else {
            PointerKind::Interior
        };
        Some((node, kind))
    }

    fn find_pointers<H>(
        &self,
        node: NodeIndex,
        shadow: &ShadowMap,
        heap: &H,
    ) -> Vec<(NodeIndex, PointerKind)>
    where
        H: ClientHeap + ?Sized,
    {
        let chunk = &self.graph[node];
        let mut found = Vec::new();
        let Some(mut addr) = round_up(chunk.base, WORD) else {
            return found;
        };
        while addr.checked_add(WORD).is_some_and(|end| end <= chunk.end()) {
            if shadow.find_no_access(addr, WORD).is_none() {
                if let Some(hit) = heap.read_word(addr).and_then(|value| self.lookup(value)) {
                    found.push(hit);
                }
            }
            addr += WORD;
        }
        found
    }

    /// Record one pointer. A chunk pointing into itself tells us nothing, and
    /// one start pointer is enough to make an edge a start edge.
    fn add_pointer(&mut self, source: NodeIndex, target: NodeIndex, kind: PointerKind) {
        if source == target {
            return;
        }
        match self.graph.find_edge(source, target) {
            Some(edge) => {
                if kind == PointerKind::Start {
                    self.graph[edge] = PointerKind::Start;
                }
            }
            None => {
                self.graph.add_edge(source, target, kind);
            }
        }
    }

    pub fn chunk(&self, node: NodeIndex) -> &Chunk {
        &self.graph[node]
    }

    /// Every node, in ascending address order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.by_base.iter().map(|&(_, node)| node)
    }

    /// Chunks `node` points to.
    pub fn pointees(&self, node: NodeIndex) -> impl Iterator<Item = (NodeIndex, PointerKind)> + '_ {
        self.graph
            .edges(node)
            .map(|edge| (edge.target(), *edge.weight()))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Graphviz rendering, one node per chunk.
    pub fn to_dot(&self) -> String {
        let labels = self.graph.map(
            |_, chunk| format!("{:#x}+{}", chunk.base, chunk.size),
            |_, kind| kind.to_string(),
        );
        format!("{}", Dot::new(&labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc::{
            heap::{ArenaHeap, ClientHeap},
            AllocKind, CallSite,
        },
        shadow::ShadowState,
    };

    fn alloc(heap: &mut ArenaHeap, size: usize) -> Chunk {
        Chunk {
            base: heap.allocate(size, 16).unwrap(),
            size,
            kind: AllocKind::Malloc,
            callsite: CallSite::UNKNOWN,
            redzone: 0,
            backing: None,
        }
    }

    #[test]
    fn finds_start_and_interior_pointers() {
        let mut heap = ArenaHeap::default();
        let a = alloc(&mut heap, 32);
        let b = alloc(&mut heap, 32);
        let c = alloc(&mut heap, 32);
        heap.store_word(a.base, b.base);
        heap.store_word(a.base + 8, c.base + 8);
        heap.store_word(b.base, b.base + 4);

        let graph = PointsToGraph::build([&a, &b, &c], &ShadowMap::new(), &heap);
        assert_eq!(graph.node_count(), 3);
        // b's self pointer is dropped.
        assert_eq!(graph.edge_count(), 2);
        let (na, _) = graph.lookup(a.base).unwrap();
        let mut pointees: Vec<(Addr, PointerKind)> = graph
            .pointees(na)
            .map(|(n, kind)| (graph.chunk(n).base, kind))
            .collect();
        pointees.sort_unstable_by_key(|&(base, _)| base);
        assert_eq!(
            pointees,
            [(b.base, PointerKind::Start), (c.base, PointerKind::Interior)]
        );
        assert!(graph.to_dot().contains("interior"));
    }

    #[test]
    fn lookup_misses_gaps_between_chunks() {
        let mut heap = ArenaHeap::default();
        let a = alloc(&mut heap, 20);
        let graph = PointsToGraph::build([&a], &ShadowMap::new(), &heap);
        assert_eq!(graph.lookup(a.base + 19).map(|(_, k)| k), Some(PointerKind::Interior));
        assert!(graph.lookup(a.base + 20).is_none());
        assert!(graph.lookup(a.base - 1).is_none());
    }

    #[test]
    fn no_access_words_are_skipped() {
        let mut heap = ArenaHeap::default();
        let a = alloc(&mut heap, 16);
        let b = alloc(&mut heap, 16);
        heap.store_word(a.base, b.base);
        let mut shadow = ShadowMap::new();
        shadow.set_range(a.base + 3, 1, ShadowState::NoAccess);
        let graph = PointsToGraph::build([&a, &b], &shadow, &heap);
        assert_eq!(graph.edge_count(), 0);
    }
}
