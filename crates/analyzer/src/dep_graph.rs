//! Per-call-frame dependency DAG and its scheduling analyses.
//!
//! The graph accumulates RAW/WAR/WAW edges while a frame executes, then
//! `init()` seals it: basic-block CTRL edges, artificial `Root`/`Dest`
//! links, and the runtime total. The insertion-order node list doubles as
//! the topological order for every analysis.

use amdahl_core::{AmdahlError, AmdahlResult, DepKind, RuntimeTable, SNode};
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use amdahl_core::Op;

/// Results of the unit-time infinite-processor analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelAnalysis {
    pub max_level: u64,
    pub frac: f64,
    pub required_processors: u64,
}

/// Results of the weighted infinite-processor analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmpiricalAnalysis {
    pub max_runtime: u64,
    pub speedup: f64,
}

pub struct DepGraph {
    edges: HashMap<SNode, HashMap<SNode, DepKind>>,
    back_edges: HashMap<SNode, HashMap<SNode, DepKind>>,
    /// Insertion order; a valid topological order once sealed.
    nodes: Vec<SNode>,
    root: SNode,
    dest: SNode,
    runtime: Arc<RuntimeTable>,
    total: u64,
    sealed: bool,
}

impl DepGraph {
    pub fn new(runtime: Arc<RuntimeTable>) -> Self {
        Self {
            edges: HashMap::new(),
            back_edges: HashMap::new(),
            nodes: Vec::new(),
            root: SNode::new(Op::Root, -1),
            dest: SNode::new(Op::Dest, -1),
            runtime,
            total: 0,
            sealed: false,
        }
    }

    pub fn root(&self) -> SNode {
        self.root
    }

    pub fn dest(&self) -> SNode {
        self.dest
    }

    /// Sum of node runtimes, available after `init()`.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    pub fn edge_kind(&self, src: SNode, dst: SNode) -> Option<DepKind> {
        self.edges.get(&src).and_then(|m| m.get(&dst)).copied()
    }

    fn ensure_node(&mut self, node: SNode) {
        self.edges.entry(node).or_default();
        self.back_edges.entry(node).or_default();
    }

    /// Add `dst` depends-on `src`. Self-edges are dropped; a re-insert
    /// overwrites the kind.
    pub fn add_edge(&mut self, src: SNode, dst: SNode, kind: DepKind) {
        if src == dst {
            return;
        }
        self.ensure_node(src);
        self.ensure_node(dst);
        self.edges.get_mut(&src).expect("ensured").insert(dst, kind);
        self.back_edges.get_mut(&dst).expect("ensured").insert(src, kind);
    }

    pub fn add_edges(&mut self, srcs: &[SNode], dst: SNode, kind: DepKind) {
        for &src in srcs {
            self.add_edge(src, dst, kind);
        }
    }

    /// Record one executed instruction in program order.
    pub fn record_order(&mut self, node: SNode) {
        self.nodes.push(node);
    }

    /// Every node with a RAW edge out of `src`, i.e. every recorded reader
    /// of the value `src` produced.
    pub fn raw_readers(&self, src: SNode) -> SmallVec<[SNode; 4]> {
        match self.edges.get(&src) {
            Some(out) => out
                .iter()
                .filter(|(_, &k)| k == DepKind::Raw)
                .map(|(&n, _)| n)
                .collect(),
            None => SmallVec::new(),
        }
    }

    /// Seal the graph once all instructions of the frame have been traced:
    /// CTRL edges between adjacent basic blocks, `Root`/`Dest` links for
    /// every root and sink, and the runtime total.
    pub fn init(&mut self) -> AmdahlResult<()> {
        if self.edge_count() == 0 {
            return Err(AmdahlError::EmptyGraph);
        }
        debug_assert!(!self.sealed, "init() must run exactly once");

        // Partition the program order into basic blocks, each ending at a
        // terminator; a trailing run without one is a block of its own.
        let mut blocks: Vec<&[SNode]> = Vec::new();
        let mut start = 0usize;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.op.is_terminator() {
                blocks.push(&self.nodes[start..=i]);
                start = i + 1;
            }
        }
        if start < self.nodes.len() {
            blocks.push(&self.nodes[start..]);
        }

        let mut ctrl: Vec<(SNode, SNode)> = Vec::new();
        for pair in blocks.windows(2) {
            let terminator = *pair[0].last().expect("blocks are non-empty");
            for &node in pair[1] {
                let already = self
                    .edges
                    .get(&terminator)
                    .is_some_and(|out| out.contains_key(&node));
                if !already {
                    ctrl.push((terminator, node));
                }
            }
        }
        for (src, dst) in ctrl {
            self.add_edge(src, dst, DepKind::Ctrl);
        }

        // Roots and sinks over the full program order, so instructions
        // with no data edges still join the graph.
        let roots: Vec<SNode> = self
            .nodes
            .iter()
            .filter(|n| self.back_edges.get(n).is_none_or(HashMap::is_empty))
            .copied()
            .collect();
        let sinks: Vec<SNode> = self
            .nodes
            .iter()
            .filter(|n| self.edges.get(n).is_none_or(HashMap::is_empty))
            .copied()
            .collect();
        for node in roots {
            self.add_edge(self.root, node, DepKind::Art);
        }
        for node in sinks {
            self.add_edge(node, self.dest, DepKind::Art);
        }

        self.nodes.insert(0, self.root);
        self.nodes.push(self.dest);

        self.total = self.nodes.iter().map(|n| self.runtime.get(n.op)).sum();
        self.sealed = true;
        Ok(())
    }

    /// Infinite processors, unit-time nodes: longest chain length, its
    /// fraction of the node count, and the widest level.
    pub fn naive_parallelisation_level(&self) -> AmdahlResult<LevelAnalysis> {
        let mut levels: HashMap<SNode, u64> = HashMap::with_capacity(self.nodes.len());
        let mut width: HashMap<u64, u64> = HashMap::new();

        for &node in &self.nodes {
            let mut max = 0u64;
            if let Some(preds) = self.back_edges.get(&node) {
                for pred in preds.keys() {
                    match levels.get(pred) {
                        Some(&lvl) => max = max.max(lvl),
                        None => {
                            return Err(AmdahlError::NotTopological(
                                node.to_string(),
                                pred.to_string(),
                            ))
                        }
                    }
                }
            }
            let lvl = max + 1;
            levels.insert(node, lvl);
            *width.entry(lvl).or_default() += 1;
        }

        let max_level = levels.get(&self.dest).copied().unwrap_or(0);
        Ok(LevelAnalysis {
            max_level,
            frac: max_level as f64 / self.nodes.len() as f64,
            required_processors: width.values().copied().max().unwrap_or(0),
        })
    }

    /// Infinite processors, weighted by the runtime table: critical-path
    /// length and its fraction of the sequential total.
    pub fn naive_parallelisation_empirical(&self) -> AmdahlResult<EmpiricalAnalysis> {
        let mut finish: HashMap<SNode, u64> = HashMap::with_capacity(self.nodes.len());

        for &node in &self.nodes {
            let mut max = 0u64;
            if let Some(preds) = self.back_edges.get(&node) {
                for pred in preds.keys() {
                    match finish.get(pred) {
                        Some(&f) => max = max.max(f),
                        None => {
                            return Err(AmdahlError::NotTopological(
                                node.to_string(),
                                pred.to_string(),
                            ))
                        }
                    }
                }
            }
            finish.insert(node, max + self.runtime.get(node.op));
        }

        let max_runtime = finish.get(&self.dest).copied().unwrap_or(0);
        Ok(EmpiricalAnalysis {
            max_runtime,
            speedup: max_runtime as f64 / self.total as f64,
        })
    }

    /// Simulated makespan on `processors` identical processors under
    /// critical-path list scheduling.
    pub fn cp_list_scheduling(&self, processors: usize) -> AmdahlResult<u64> {
        // Priorities in reverse topological order: runtime plus the best
        // downstream priority.
        let mut priority: HashMap<SNode, u64> = HashMap::with_capacity(self.nodes.len());
        for &node in self.nodes.iter().rev() {
            let mut max = 0u64;
            if let Some(succs) = self.edges.get(&node) {
                for succ in succs.keys() {
                    match priority.get(succ) {
                        Some(&p) => max = max.max(p),
                        None => {
                            return Err(AmdahlError::NotTopological(
                                succ.to_string(),
                                node.to_string(),
                            ))
                        }
                    }
                }
            }
            priority.insert(node, max + self.runtime.get(node.op));
        }

        let mut remaining_deps: HashMap<SNode, usize> = self
            .nodes
            .iter()
            .map(|n| (*n, self.back_edges.get(n).map_or(0, HashMap::len)))
            .collect();

        let mut ready: BinaryHeap<ReadyTask> = BinaryHeap::new();
        let mut running: BinaryHeap<Reverse<RunningTask>> = BinaryHeap::new();
        let mut seq = 0u64;
        let mut now = 0u64;
        let mut finished = 0usize;

        ready.push(ReadyTask {
            priority: priority[&self.root],
            seq,
            node: self.root,
        });

        while !ready.is_empty() || !running.is_empty() {
            while running.len() < processors {
                let Some(task) = ready.pop() else { break };
                seq += 1;
                running.push(Reverse(RunningTask {
                    finish: now + self.runtime.get(task.node.op),
                    seq,
                    node: task.node,
                }));
            }

            let Some(Reverse(done)) = running.pop() else {
                // Processors idle, nothing ready, work left: the order is
                // broken.
                return Err(AmdahlError::IdleDeadlock);
            };
            now = done.finish;
            finished += 1;

            if let Some(succs) = self.edges.get(&done.node) {
                for succ in succs.keys() {
                    let deps = remaining_deps
                        .get_mut(succ)
                        .expect("successors are known nodes");
                    *deps -= 1;
                    if *deps == 0 {
                        seq += 1;
                        ready.push(ReadyTask {
                            priority: priority[succ],
                            seq,
                            node: *succ,
                        });
                    }
                }
            }
        }

        if finished != self.nodes.len() {
            return Err(AmdahlError::IdleDeadlock);
        }
        Ok(now)
    }

    /// RAW/WAR/WAW edge counts over the whole graph.
    pub fn edge_distribution(&self) -> (usize, usize, usize) {
        let (mut raw, mut war, mut waw) = (0, 0, 0);
        for out in self.edges.values() {
            for kind in out.values() {
                match kind {
                    DepKind::Raw => raw += 1,
                    DepKind::War => war += 1,
                    DepKind::Waw => waw += 1,
                    DepKind::Ctrl | DepKind::Art => {}
                }
            }
        }
        (raw, war, waw)
    }

    /// Back-adjacency mirror check, used by the invariants test.
    #[cfg(test)]
    fn adjacency_is_dual(&self) -> bool {
        let forward: usize = self.edges.values().map(HashMap::len).sum();
        let backward: usize = self.back_edges.values().map(HashMap::len).sum();
        forward == backward
            && self.edges.iter().all(|(src, out)| {
                out.iter()
                    .all(|(dst, kind)| self.back_edges[dst].get(src) == Some(kind))
            })
    }
}

/// Ready-queue entry: highest priority first, FIFO on ties.
#[derive(Debug, PartialEq, Eq)]
struct ReadyTask {
    priority: u64,
    seq: u64,
    node: SNode,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// In-flight entry: earliest finish first, insertion order on ties.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RunningTask {
    finish: u64,
    seq: u64,
    node: SNode,
}
