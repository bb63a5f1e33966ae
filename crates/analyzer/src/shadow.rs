//! Shadow stack, memory, and storage tracking the most recent producer of
//! every stack slot, memory byte, and storage cell, emitting RAW/WAR/WAW
//! edges into the frame's dependency graph.

use alloy_primitives::{Address, B256};
use amdahl_core::{DepKind, Op, SNode};
use std::collections::HashMap;

use crate::dep_graph::DepGraph;

/// Mirror of the EVM stack holding the producing instruction of each slot.
#[derive(Default)]
pub struct ShadowStack {
    data: Vec<SNode>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self { data: Vec::with_capacity(16) }
    }

    pub fn from_buffer(mut data: Vec<SNode>) -> Self {
        data.clear();
        Self { data }
    }

    pub fn into_buffer(self) -> Vec<SNode> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pop `n` slots; reading them is a RAW dependency of `dest` on each
    /// producer.
    pub fn consume_n(&mut self, n: usize, dest: SNode, graph: &mut DepGraph) {
        debug_assert!(self.data.len() >= n, "shadow stack underflow");
        for _ in 0..n {
            if let Some(src) = self.data.pop() {
                graph.add_edge(src, dest, DepKind::Raw);
            }
        }
    }

    pub fn push(&mut self, node: SNode) {
        self.data.push(node);
    }

    /// Replace the top and the `n`th-from-top slot with `dest`: a WAW on
    /// each former occupant, and a WAR from every recorded reader of
    /// those occupants, whose reads must precede the overwrite.
    pub fn swap(&mut self, n: usize, dest: SNode, graph: &mut DepGraph) {
        let len = self.data.len();
        debug_assert!(n >= 2 && len >= n, "swap depth exceeds shadow stack");
        for slot in [len - 1, len - n] {
            let prev = self.data[slot];
            graph.add_edge(prev, dest, DepKind::Waw);
            for reader in graph.raw_readers(prev) {
                graph.add_edge(reader, dest, DepKind::War);
            }
            self.data[slot] = dest;
        }
    }

    /// Duplicating reads the `n`th-from-top slot.
    pub fn dup(&mut self, n: usize, dest: SNode, graph: &mut DepGraph) {
        debug_assert!(self.data.len() >= n, "dup depth exceeds shadow stack");
        let src = self.data[self.data.len() - n];
        graph.add_edge(src, dest, DepKind::Raw);
        self.data.push(dest);
    }
}

/// Byte-granular mirror of the EVM memory.
pub struct ShadowMemory {
    store: Vec<SNode>,
    last_resize: SNode,
}

impl Default for ShadowMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMemory {
    pub fn new() -> Self {
        Self {
            store: Vec::new(),
            last_resize: SNode::new(Op::Nop, -1),
        }
    }

    pub fn from_buffer(mut store: Vec<SNode>) -> Self {
        store.clear();
        Self {
            store,
            last_resize: SNode::new(Op::Nop, -1),
        }
    }

    pub fn into_buffer(self) -> Vec<SNode> {
        self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn last_resize(&self) -> SNode {
        self.last_resize
    }

    /// Grow in lockstep with the EVM memory. The expanding instruction
    /// produces the zero-fill, so new cells carry its node.
    pub fn resize(&mut self, size: usize, dest: SNode) {
        if size > self.store.len() {
            self.last_resize = dest;
            self.store.resize(size, dest);
        }
    }

    /// Overwrite the range with `dest`: WAW on every previous non-sentinel
    /// occupant, WAR from every recorded reader of those occupants.
    pub fn set(&mut self, offset: usize, size: usize, dest: SNode, graph: &mut DepGraph) {
        if size == 0 {
            return;
        }
        debug_assert!(offset + size <= self.store.len(), "resize precedes set");
        for i in offset..offset + size {
            let prev = self.store[i];
            if prev.op != Op::Nop {
                graph.add_edge(prev, dest, DepKind::Waw);
                for reader in graph.raw_readers(prev) {
                    graph.add_edge(reader, dest, DepKind::War);
                }
            }
            self.store[i] = dest;
        }
    }

    pub fn set32(&mut self, offset: usize, dest: SNode, graph: &mut DepGraph) {
        self.set(offset, 32, dest, graph);
    }

    /// Reading the range is a RAW dependency on each distinct occupant.
    /// Reads past the current length contribute nothing.
    pub fn get_ptr(&self, offset: usize, size: usize, dest: SNode, graph: &mut DepGraph) {
        if size == 0 || offset >= self.store.len() {
            return;
        }
        let end = (offset + size).min(self.store.len());
        for &src in &self.store[offset..end] {
            graph.add_edge(src, dest, DepKind::Raw);
        }
    }

    pub fn get_copy(&self, offset: usize, size: usize, dest: SNode, graph: &mut DepGraph) {
        self.get_ptr(offset, size, dest, graph);
    }
}

/// Last writing instruction of each storage cell touched by this frame.
#[derive(Default)]
pub struct ShadowStorage {
    state: HashMap<Address, HashMap<B256, SNode>>,
}

impl ShadowStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read depends on the frame's last writer of the cell, or on `Root`
    /// when the value is externally supplied.
    pub fn get_state(&self, addr: Address, key: B256, dest: SNode, graph: &mut DepGraph) {
        match self.state.get(&addr).and_then(|cells| cells.get(&key)) {
            Some(&writer) => graph.add_edge(writer, dest, DepKind::Raw),
            None => graph.add_edge(graph.root(), dest, DepKind::Raw),
        }
    }

    /// A write follows the previous writer (WAW) and all of its readers
    /// (WAR), then becomes the standing writer itself.
    pub fn set_state(&mut self, addr: Address, key: B256, dest: SNode, graph: &mut DepGraph) {
        let cells = self.state.entry(addr).or_default();
        if let Some(&prev) = cells.get(&key) {
            graph.add_edge(prev, dest, DepKind::Waw);
            for reader in graph.raw_readers(prev) {
                graph.add_edge(reader, dest, DepKind::War);
            }
        }
        cells.insert(key, dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amdahl_core::{opcode, RuntimeTable};
    use std::sync::Arc;

    fn graph() -> DepGraph {
        DepGraph::new(Arc::new(RuntimeTable::for_block(1_000_000)))
    }

    fn node(op: u8, seq: i64) -> SNode {
        SNode::new(Op::Byte(op), seq)
    }

    #[test]
    fn consume_emits_raw_per_slot() {
        let mut g = graph();
        let mut stack = ShadowStack::new();
        let a = node(opcode::PUSH1, 0);
        let b = node(opcode::PUSH1, 1);
        let add = node(opcode::ADD, 2);
        stack.push(a);
        stack.push(b);
        stack.consume_n(2, add, &mut g);
        assert_eq!(g.edge_kind(a, add), Some(DepKind::Raw));
        assert_eq!(g.edge_kind(b, add), Some(DepKind::Raw));
        assert!(stack.is_empty());
    }

    #[test]
    fn swap_overwrites_both_slots_with_war_propagation() {
        let mut g = graph();
        let mut stack = ShadowStack::new();
        let a = node(opcode::PUSH1, 0);
        let b = node(opcode::PUSH1, 1);
        let reader = node(opcode::MLOAD, 2);
        // `reader` consumed a copy of `a` earlier.
        g.add_edge(a, reader, DepKind::Raw);

        stack.push(a);
        stack.push(b);
        let swap = node(opcode::SWAP1, 3);
        stack.swap(2, swap, &mut g);

        assert_eq!(g.edge_kind(a, swap), Some(DepKind::Waw));
        assert_eq!(g.edge_kind(b, swap), Some(DepKind::Waw));
        assert_eq!(g.edge_kind(reader, swap), Some(DepKind::War));
        // Both slots now carry the swap node.
        let dest = node(opcode::ADD, 4);
        stack.consume_n(2, dest, &mut g);
        assert_eq!(g.edge_kind(swap, dest), Some(DepKind::Raw));
    }

    #[test]
    fn dup_reads_the_source_slot() {
        let mut g = graph();
        let mut stack = ShadowStack::new();
        let a = node(opcode::PUSH1, 0);
        stack.push(a);
        let dup = node(opcode::DUP1, 1);
        stack.dup(1, dup, &mut g);
        assert_eq!(g.edge_kind(a, dup), Some(DepKind::Raw));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn memory_set_emits_waw_and_war() {
        let mut g = graph();
        let mut mem = ShadowMemory::new();
        let w1 = node(opcode::MSTORE, 0);
        mem.resize(32, w1);
        mem.set32(0, w1, &mut g);

        let reader = node(opcode::MLOAD, 1);
        mem.get_ptr(0, 32, reader, &mut g);
        assert_eq!(g.edge_kind(w1, reader), Some(DepKind::Raw));

        let w2 = node(opcode::MSTORE, 2);
        mem.set32(0, w2, &mut g);
        assert_eq!(g.edge_kind(w1, w2), Some(DepKind::Waw));
        assert_eq!(g.edge_kind(reader, w2), Some(DepKind::War));
    }

    #[test]
    fn resized_cells_carry_the_expanding_instruction() {
        let mut g = graph();
        let mut mem = ShadowMemory::new();
        let grower = node(opcode::MLOAD, 0);
        mem.resize(64, grower);
        assert_eq!(mem.last_resize(), grower);

        let reader = node(opcode::KECCAK256, 1);
        mem.get_ptr(32, 32, reader, &mut g);
        assert_eq!(g.edge_kind(grower, reader), Some(DepKind::Raw));
    }

    #[test]
    fn memory_reads_past_length_are_silent() {
        let mut g = graph();
        let mem = ShadowMemory::new();
        let reader = node(opcode::MLOAD, 0);
        mem.get_ptr(128, 32, reader, &mut g);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn storage_read_without_writer_comes_from_root() {
        let mut g = graph();
        let storage = ShadowStorage::new();
        let load = node(opcode::SLOAD, 0);
        storage.get_state(Address::with_last_byte(1), B256::ZERO, load, &mut g);
        assert_eq!(g.edge_kind(g.root(), load), Some(DepKind::Raw));
    }

    #[test]
    fn storage_write_chain_tracks_latest_writer() {
        let mut g = graph();
        let mut storage = ShadowStorage::new();
        let addr = Address::with_last_byte(1);
        let key = B256::ZERO;

        let w1 = node(opcode::SSTORE, 0);
        storage.set_state(addr, key, w1, &mut g);
        let load = node(opcode::SLOAD, 1);
        storage.get_state(addr, key, load, &mut g);
        assert_eq!(g.edge_kind(w1, load), Some(DepKind::Raw));

        let w2 = node(opcode::SSTORE, 2);
        storage.set_state(addr, key, w2, &mut g);
        assert_eq!(g.edge_kind(w1, w2), Some(DepKind::Waw));
        assert_eq!(g.edge_kind(load, w2), Some(DepKind::War));

        // The newest writer replaces the old one.
        let w3 = node(opcode::SSTORE, 3);
        storage.set_state(addr, key, w3, &mut g);
        assert_eq!(g.edge_kind(w2, w3), Some(DepKind::Waw));
    }
}
