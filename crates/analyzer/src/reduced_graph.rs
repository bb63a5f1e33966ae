//! Per-transaction reduced value DAG: semantically equivalent operations
//! collapse to one node, keyed by a canonical hash of opcode, result
//! value, and sorted dependency ids.
//!
//! Nodes live in an arena owned by the [`ReducedGraph`]; the arena index
//! is the node's transaction-unique id, so sentinel nodes allocated by the
//! reduced shadow state draw from the same counter.

use alloy_primitives::{Address, B256, U256};
use amdahl_core::{opcode, Op};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Arena index of a reduced node; doubles as its unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RId(pub u32);

pub type DepList = SmallVec<[RId; 4]>;

#[derive(Debug, Clone)]
pub struct RNode {
    pub op: Op,
    pub val: U256,
    pub deps: DepList,
}

/// Opcodes whose result may never be shared between instances.
pub fn reusable(op: u8) -> bool {
    !matches!(
        op,
        opcode::CREATE
            | opcode::CREATE2
            | opcode::CALL
            | opcode::CALLCODE
            | opcode::DELEGATECALL
            | opcode::STATICCALL
            | opcode::GAS
    )
}

/// Totals for the five op families the redundancy trace reports on.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpCounts {
    pub sloads: u64,
    pub sloads_cached: u64,
    pub sstores: u64,
    pub sstores_cached: u64,
    pub mloads: u64,
    pub mloads_cached: u64,
    pub mstores: u64,
    pub mstores_cached: u64,
    pub mstore8s: u64,
    pub mstore8s_cached: u64,
}

impl OpCounts {
    /// A transaction with no memory or storage operations produces no
    /// redundancy output at all.
    pub fn is_empty(&self) -> bool {
        self.sloads == 0
            && self.sstores == 0
            && self.mloads == 0
            && self.mstores == 0
            && self.mstore8s == 0
    }
}

pub struct ReducedGraph {
    nodes: Vec<RNode>,
    intern: HashMap<String, RId>,
    /// Per-opcode `(reuse count, reused gas)`.
    redundancy: [(u64, u64); 256],
    pub counts: OpCounts,
}

impl Default for ReducedGraph {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            intern: HashMap::new(),
            redundancy: [(0, 0); 256],
            counts: OpCounts::default(),
        }
    }
}

impl ReducedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: RId) -> &RNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Deduplicate in insertion order, then sort by id: the canonical dep
    /// order used for hashing.
    pub fn order_deps(deps: &mut DepList) {
        let mut seen: SmallVec<[RId; 8]> = SmallVec::new();
        deps.retain(|d| {
            if seen.contains(d) {
                false
            } else {
                seen.push(*d);
                true
            }
        });
        deps.sort_unstable();
    }

    fn canonical_hash(op: Op, val: &U256, deps: &[RId]) -> String {
        use std::fmt::Write;
        let mut key = format!("{}_{:#x}", op, val);
        for dep in deps {
            let _ = write!(key, "_{}", dep.0);
        }
        key
    }

    fn alloc(&mut self, node: RNode) -> RId {
        let id = RId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Fresh sentinel standing in for an externally supplied or
    /// never-written value. Not interned: every sentinel is unique.
    pub fn new_sentinel(&mut self) -> RId {
        self.alloc(RNode {
            op: Op::Nop,
            val: U256::ZERO,
            deps: DepList::new(),
        })
    }

    /// Insert unconditionally with a fresh id, bypassing reuse detection.
    /// The node is still interned under its hash; an identical later key
    /// resolves to the newest generation.
    pub fn add_new_node(&mut self, op: Op, val: U256, mut deps: DepList) -> RId {
        Self::order_deps(&mut deps);
        let id = self.alloc(RNode { op, val, deps });
        let node = &self.nodes[id.0 as usize];
        let hash = Self::canonical_hash(node.op, &node.val, &node.deps);
        self.intern.insert(hash, id);
        id
    }

    /// Return the existing node for this computation, or insert the
    /// candidate. `true` means the computation was already in the graph.
    pub fn try_add(&mut self, op: Op, val: U256, mut deps: DepList) -> (RId, bool) {
        Self::order_deps(&mut deps);
        let hash = Self::canonical_hash(op, &val, &deps);
        if let Some(&id) = self.intern.get(&hash) {
            return (id, true);
        }
        let id = self.alloc(RNode { op, val, deps });
        self.intern.insert(hash, id);
        (id, false)
    }

    pub fn record_redundancy(&mut self, op: u8, gas: u64) {
        let slot = &mut self.redundancy[op as usize];
        slot.0 += 1;
        slot.1 += gas;
    }

    /// `(reuse count, reused gas)` for one opcode byte.
    pub fn redundancy(&self, op: u8) -> (u64, u64) {
        self.redundancy[op as usize]
    }
}

// ---------------------------------------------------------------------------
// Reduced shadow state
// ---------------------------------------------------------------------------

/// Mirror of the EVM stack holding reduced-node ids.
#[derive(Default)]
pub struct ReducedStack {
    data: Vec<RId>,
}

impl ReducedStack {
    pub fn new() -> Self {
        Self { data: Vec::with_capacity(16) }
    }

    pub fn from_buffer(mut data: Vec<RId>) -> Self {
        data.clear();
        Self { data }
    }

    pub fn into_buffer(self) -> Vec<RId> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pop `n` ids; they become the candidate's dep list.
    pub fn consume_n(&mut self, n: usize) -> DepList {
        debug_assert!(self.data.len() >= n, "reduced stack underflow");
        let mut deps = DepList::new();
        for _ in 0..n {
            if let Some(id) = self.data.pop() {
                deps.push(id);
            }
        }
        deps
    }

    pub fn push(&mut self, id: RId) {
        self.data.push(id);
    }

    /// Plain reference shuffle: no node is created and no reuse counted.
    pub fn swap(&mut self, n: usize) {
        let len = self.data.len();
        self.data.swap(len - 1, len - n);
    }

    /// Plain reference copy, as with `swap`.
    pub fn dup(&mut self, n: usize) {
        let id = self.data[self.data.len() - n];
        self.data.push(id);
    }
}

/// Byte-granular mirror of the EVM memory holding reduced-node ids.
#[derive(Default)]
pub struct ReducedMemory {
    store: Vec<RId>,
}

impl ReducedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Grow to `size`, filling fresh cells with one new sentinel so dep
    /// lists over never-written bytes are never empty.
    pub fn resize(&mut self, size: usize, graph: &mut ReducedGraph) {
        if size > self.store.len() {
            let sentinel = graph.new_sentinel();
            self.store.resize(size, sentinel);
        }
    }

    /// Overwrite the range with `id`; `true` iff every byte already held
    /// `id` (an idempotent store).
    pub fn set(&mut self, offset: usize, size: usize, id: RId) -> bool {
        if size == 0 {
            return true;
        }
        debug_assert!(offset + size <= self.store.len(), "resize precedes set");
        let mut reused = true;
        for cell in &mut self.store[offset..offset + size] {
            if *cell != id {
                reused = false;
            }
            *cell = id;
        }
        reused
    }

    pub fn set32(&mut self, offset: usize, id: RId) -> bool {
        self.set(offset, 32, id)
    }

    /// Distinct occupants of the range in stored order. Reads past the
    /// current length yield nothing.
    pub fn get_ptr(&self, offset: usize, size: usize) -> DepList {
        let mut deps = DepList::new();
        if size == 0 || offset >= self.store.len() {
            return deps;
        }
        let end = (offset + size).min(self.store.len());
        for &id in &self.store[offset..end] {
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
        deps
    }

    pub fn get_copy(&self, offset: usize, size: usize) -> DepList {
        self.get_ptr(offset, size)
    }
}

/// Last reduced writer of each storage cell.
#[derive(Default)]
pub struct ReducedStorage {
    state: HashMap<Address, HashMap<B256, RId>>,
}

impl ReducedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standing writer of the cell; a never-written cell gets a fresh
    /// sentinel recorded so repeated reads share one dep.
    pub fn get_state(&mut self, addr: Address, key: B256, graph: &mut ReducedGraph) -> RId {
        *self
            .state
            .entry(addr)
            .or_default()
            .entry(key)
            .or_insert_with(|| graph.new_sentinel())
    }

    /// Record `id` as the writer; `true` iff the cell already held `id`
    /// (a same-computation overwrite).
    pub fn set_state(&mut self, addr: Address, key: B256, id: RId) -> bool {
        let slot = self.state.entry(addr).or_default().entry(key);
        match slot {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let reused = *e.get() == id;
                e.insert(id);
                reused
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(id);
                false
            }
        }
    }
}
