//! Leak classification over the points-to graph.
//!
//! Roots reach chunks, chunks reach chunks, and whatever is left over is
//! lost. Of the lost chunks, those only reachable from other lost chunks are
//! *indirectly* lost: freeing the chunks that point at them would have
//! freed them too, so their bytes are charged to the leader of their group.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use hashbrown::HashMap;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use super::logical::{PointerKind, PointsToGraph};
use crate::{
    alloc::{heap::ClientHeap, CallSite, Chunk},
    config::LeakCheckMode,
    serialize::serde_hex,
    shadow::ShadowMap,
    Addr,
};

/// How a chunk is reached, from worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reachedness {
    /// Nothing points to it.
    Unreached,
    /// Only other unreached chunks point to it.
    IndirectLeak,
    /// Only pointers into its middle reach it.
    Interior,
    /// A start pointer from a root or a reached chunk.
    Proper,
}

impl Reachedness {
    pub const fn describe(self) -> &'static str {
        match self {
            Reachedness::Unreached => "definitely lost",
            Reachedness::IndirectLeak => "indirectly lost",
            Reachedness::Interior => "possibly lost",
            Reachedness::Proper => "still reachable",
        }
    }

    fn via(kind: PointerKind) -> Self {
        match kind {
            PointerKind::Start => Reachedness::Proper,
            PointerKind::Interior => Reachedness::Interior,
        }
    }
}

/// Per-node results, indexed by `NodeIndex::index()`.
#[derive(Clone, Debug)]
pub struct Classification {
    pub reachedness: Vec<Reachedness>,
    /// Bytes of the indirectly lost chunks charged to each leader.
    pub indirect_bytes: Vec<usize>,
}

impl Classification {
    pub fn of(&self, node: NodeIndex) -> Reachedness {
        self.reachedness[node.index()]
    }
}

/// Classify every chunk of `graph` given the `roots` (pointer-sized values
/// found in registers, stacks and globals).
pub fn classify(graph: &PointsToGraph, roots: &[usize]) -> Classification {
    let n = graph.node_count();
    let mut reachedness = vec![Reachedness::Unreached; n];
    let mut work: Vec<NodeIndex> = Vec::new();

    let mut upgrade = |node: NodeIndex, to: Reachedness, work: &mut Vec<NodeIndex>| {
        let state = &mut reachedness[node.index()];
        if to > *state {
            *state = to;
            work.push(node);
        }
    };
    for &root in roots {
        if let Some((node, kind)) = graph.lookup(root) {
            upgrade(node, Reachedness::via(kind), &mut work);
        }
    }
    while let Some(node) = work.pop() {
        for (target, kind) in graph.pointees(node) {
            upgrade(target, Reachedness::via(kind), &mut work);
        }
    }

    // Every unreached chunk, in address order, claims whatever unreached
    // chunks hang off it. Leaders claimed later fold their claims in.
    let mut indirect_bytes = vec![0; n];
    for leader in graph.nodes() {
        if reachedness[leader.index()] != Reachedness::Unreached {
            continue;
        }
        let mut stack = vec![leader];
        while let Some(node) = stack.pop() {
            for (target, _) in graph.pointees(node) {
                let t = target.index();
                if target == leader || reachedness[t] != Reachedness::Unreached {
                    continue;
                }
                reachedness[t] = Reachedness::IndirectLeak;
                let claimed = graph.chunk(target).size + std::mem::take(&mut indirect_bytes[t]);
                indirect_bytes[leader.index()] += claimed;
                stack.push(target);
            }
        }
    }

    Classification {
        reachedness,
        indirect_bytes,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakSummary {
    pub leaked_bytes: usize,
    pub leaked_blocks: usize,
    pub indirect_bytes: usize,
    pub indirect_blocks: usize,
    pub dubious_bytes: usize,
    pub dubious_blocks: usize,
    pub reachable_bytes: usize,
    pub reachable_blocks: usize,
}

impl LeakSummary {
    fn add(&mut self, reachedness: Reachedness, size: usize) {
        let (bytes, blocks) = match reachedness {
            Reachedness::Unreached => (&mut self.leaked_bytes, &mut self.leaked_blocks),
            Reachedness::IndirectLeak => (&mut self.indirect_bytes, &mut self.indirect_blocks),
            Reachedness::Interior => (&mut self.dubious_bytes, &mut self.dubious_blocks),
            Reachedness::Proper => (&mut self.reachable_bytes, &mut self.reachable_blocks),
        };
        *bytes += size;
        *blocks += 1;
    }
}

/// All chunks allocated at one site that ended up equally lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossRecord {
    pub allocated_at: CallSite,
    pub loss_mode: Reachedness,
    pub total_bytes: usize,
    pub indirect_bytes: usize,
    pub num_blocks: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedChunk {
    #[serde(with = "serde_hex")]
    pub base: Addr,
    pub size: usize,
    pub callsite: CallSite,
    pub reachedness: Reachedness,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub mode: LeakCheckMode,
    pub summary: LeakSummary,
    /// Only in [`LeakCheckMode::Full`]: smallest loss first.
    pub records: Vec<LossRecord>,
    /// Only in [`LeakCheckMode::Full`], in address order.
    pub chunks: Vec<ClassifiedChunk>,
}

#[non_exhaustive]
#[derive(Debug)]
pub enum LeakReportFromFileError {
    IoError(io::Error),
    SerdeJsonError(serde_json::error::Error),
}

impl LeakReport {
    pub fn reachedness_of(&self, base: Addr) -> Option<Reachedness> {
        self.chunks
            .iter()
            .find(|chunk| chunk.base == base)
            .map(|chunk| chunk.reachedness)
    }

    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut file = File::create(path)?;
        file.write_all(&json)?;
        Ok(())
    }

    pub fn from_file<P>(path: P) -> Result<Self, LeakReportFromFileError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path).map_err(LeakReportFromFileError::IoError)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(LeakReportFromFileError::IoError)?;
        serde_json::from_str(&buf).map_err(LeakReportFromFileError::SerdeJsonError)
    }

    /// The end-of-run leak summary, and in full mode one line per lost
    /// record.
    pub fn log(&self) {
        let s = &self.summary;
        log::info!("LEAK SUMMARY:");
        log::info!("   definitely lost: {} bytes in {} blocks", s.leaked_bytes, s.leaked_blocks);
        log::info!("   indirectly lost: {} bytes in {} blocks", s.indirect_bytes, s.indirect_blocks);
        log::info!("     possibly lost: {} bytes in {} blocks", s.dubious_bytes, s.dubious_blocks);
        log::info!("   still reachable: {} bytes in {} blocks", s.reachable_bytes, s.reachable_blocks);
        let n = self.records.len();
        for (i, record) in self.records.iter().enumerate() {
            let level = if record.loss_mode == Reachedness::Proper {
                log::Level::Debug
            } else {
                log::Level::Info
            };
            log::log!(
                level,
                "{} ({} direct, {} indirect) bytes in {} blocks are {} in loss record {} of {} (site {:#x})",
                record.total_bytes + record.indirect_bytes,
                record.total_bytes,
                record.indirect_bytes,
                record.num_blocks,
                record.loss_mode.describe(),
                i + 1,
                n,
                record.allocated_at.0
            );
        }
    }
}

/// Build the graph, classify it, and tally the results.
pub(crate) fn check<H>(
    chunks: Vec<&Chunk>,
    roots: &[usize],
    shadow: &ShadowMap,
    heap: &H,
    mode: LeakCheckMode,
) -> LeakReport
where
    H: ClientHeap + ?Sized,
{
    let graph = PointsToGraph::build(chunks, shadow, heap);
    let classification = classify(&graph, roots);

    let mut summary = LeakSummary::default();
    for node in graph.nodes() {
        summary.add(classification.of(node), graph.chunk(node).size);
    }

    let mut records = Vec::new();
    let mut classified = Vec::new();
    if mode == LeakCheckMode::Full {
        let mut grouped: HashMap<(CallSite, Reachedness), LossRecord, ahash::RandomState> =
            HashMap::default();
        for node in graph.nodes() {
            let chunk = graph.chunk(node);
            let reachedness = classification.of(node);
            let record = grouped
                .entry((chunk.callsite, reachedness))
                .or_insert(LossRecord {
                    allocated_at: chunk.callsite,
                    loss_mode: reachedness,
                    total_bytes: 0,
                    indirect_bytes: 0,
                    num_blocks: 0,
                });
            record.total_bytes += chunk.size;
            record.indirect_bytes += classification.indirect_bytes[node.index()];
            record.num_blocks += 1;
            classified.push(ClassifiedChunk {
                base: chunk.base,
                size: chunk.size,
                callsite: chunk.callsite,
                reachedness,
            });
        }
        records = grouped.into_values().collect();
        records.sort_unstable_by_key(|r| {
            (r.total_bytes + r.indirect_bytes, r.loss_mode, r.allocated_at)
        });
    }

    LeakReport {
        mode,
        summary,
        records,
        chunks: classified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{heap::ArenaHeap, AllocKind};

    struct World {
        heap: ArenaHeap,
        chunks: Vec<Chunk>,
    }

    impl World {
        fn new() -> Self {
            Self {
                heap: ArenaHeap::default(),
                chunks: Vec::new(),
            }
        }

        fn alloc(&mut self, size: usize, site: u64) -> Addr {
            let base = self.heap.allocate(size, 16).unwrap();
            self.heap.fill(base, size, 0);
            self.chunks.push(Chunk {
                base,
                size,
                kind: AllocKind::Malloc,
                callsite: CallSite(site),
                redzone: 0,
                backing: None,
            });
            base
        }

        fn check(&self, roots: &[usize], mode: LeakCheckMode) -> LeakReport {
            check(
                self.chunks.iter().collect(),
                roots,
                &ShadowMap::new(),
                &self.heap,
                mode,
            )
        }
    }

    #[test]
    fn four_way_classification() {
        let mut w = World::new();
        let proper = w.alloc(32, 1);
        let interior = w.alloc(32, 2);
        let child = w.alloc(16, 3);
        let leader = w.alloc(32, 4);
        let lost_child = w.alloc(16, 5);
        // Reached through an interior pointer, but its start pointer to
        // `child` still makes that one proper.
        w.heap.store_word(interior, child);
        w.heap.store_word(leader, lost_child);

        let report = w.check(&[proper, interior + 8], LeakCheckMode::Full);
        assert_eq!(report.reachedness_of(proper), Some(Reachedness::Proper));
        assert_eq!(report.reachedness_of(interior), Some(Reachedness::Interior));
        assert_eq!(report.reachedness_of(child), Some(Reachedness::Proper));
        assert_eq!(report.reachedness_of(leader), Some(Reachedness::Unreached));
        assert_eq!(report.reachedness_of(lost_child), Some(Reachedness::IndirectLeak));

        let s = report.summary;
        assert_eq!((s.leaked_bytes, s.leaked_blocks), (32, 1));
        assert_eq!((s.indirect_bytes, s.indirect_blocks), (16, 1));
        assert_eq!((s.dubious_bytes, s.dubious_blocks), (32, 1));
        assert_eq!((s.reachable_bytes, s.reachable_blocks), (48, 2));
    }

    #[test]
    fn lost_cycle_has_exactly_one_leader() {
        let mut w = World::new();
        let a = w.alloc(16, 1);
        let b = w.alloc(16, 1);
        let c = w.alloc(16, 1);
        w.heap.store_word(a, b);
        w.heap.store_word(b, c);
        w.heap.store_word(c, a);

        let report = w.check(&[], LeakCheckMode::Full);
        assert_eq!(report.summary.leaked_blocks, 1);
        assert_eq!(report.summary.indirect_blocks, 2);
        let lost: Vec<&LossRecord> = report
            .records
            .iter()
            .filter(|r| r.loss_mode == Reachedness::Unreached)
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].indirect_bytes, 32);
    }

    #[test]
    fn later_leader_absorbs_earlier_one() {
        let mut w = World::new();
        let a = w.alloc(16, 1);
        let b = w.alloc(16, 1);
        let c = w.alloc(16, 1);
        // c -> a -> b: a is visited first and claims b, then c claims a.
        w.heap.store_word(c, a);
        w.heap.store_word(a, b);

        let report = w.check(&[], LeakCheckMode::Full);
        assert_eq!(report.reachedness_of(c), Some(Reachedness::Unreached));
        assert_eq!(report.reachedness_of(a), Some(Reachedness::IndirectLeak));
        assert_eq!(report.reachedness_of(b), Some(Reachedness::IndirectLeak));
        let record = report
            .records
            .iter()
            .find(|r| r.loss_mode == Reachedness::Unreached)
            .unwrap();
        assert_eq!(record.indirect_bytes, 32);
    }

    #[test]
    fn records_are_grouped_by_site_and_sorted() {
        let mut w = World::new();
        w.alloc(100, 7);
        w.alloc(100, 7);
        w.alloc(10, 8);
        let report = w.check(&[], LeakCheckMode::Full);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].allocated_at, CallSite(8));
        assert_eq!(report.records[1].num_blocks, 2);
        assert_eq!(report.records[1].total_bytes, 200);

        let summary_only = w.check(&[], LeakCheckMode::Summary);
        assert!(summary_only.records.is_empty());
        assert!(summary_only.chunks.is_empty());
        assert_eq!(summary_only.summary, report.summary);
    }

    #[test]
    fn report_survives_a_trip_through_a_file() {
        let mut w = World::new();
        w.alloc(24, 3);
        let report = w.check(&[], LeakCheckMode::Full);
        let path = std::env::temp_dir().join(format!("taintheap-leak-{}.json", std::process::id()));
        report.write_to_file(&path).unwrap();
        let back = LeakReport::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, report);
        assert!(matches!(
            LeakReport::from_file(path),
            Err(LeakReportFromFileError::IoError(_))
        ));
    }
}
