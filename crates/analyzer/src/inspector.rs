//! Per-instruction instrumentation as a revm [`Inspector`].
//!
//! The inspector mirrors every executed instruction into two independent
//! structures: the per-frame dependency DAG (through the shadow stack,
//! memory, and storage) and the per-transaction reduced value DAG (through
//! the reduced shadow state), with the concrete value cache auditing every
//! reuse verdict.
//!
//! Operands are captured at `step` (pre-execution stack view); effects are
//! applied at `step_end`, when the result and the expanded memory are
//! observable. Call and create instructions are the exception: their
//! result only materialises when the parent frame resumes, so they are
//! instrumented at `step` and their return-data write at `call_end`.

use alloy_primitives::{Address, B256, U256};
use amdahl_core::{opcode as op, AmdahlError, AmdahlResult, Op, RuntimeTable, SNode};
use revm::inspector::Inspector;
use revm::interpreter::interpreter::EthInterpreter;
use revm::interpreter::{
    interpreter_types::*, CallInputs, CallOutcome, CreateInputs, CreateOutcome, Interpreter,
};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::dep_graph::DepGraph;
use crate::reduced_graph::{
    reusable, DepList, RId, ReducedGraph, ReducedMemory, ReducedStack, ReducedStorage,
};
use crate::shadow::{ShadowMemory, ShadowStack, ShadowStorage};
use crate::value_cache::{CachedMemory, CachedStorage};

/// Everything the analyses need once a transaction has been traced.
pub struct TraceOutput {
    /// Finalized per-frame dependency graphs in frame-creation order;
    /// `None` where a frame produced no edges.
    pub graphs: Vec<Option<DepGraph>>,
    /// The transaction's reduced value DAG with its redundancy counters.
    pub rgraph: ReducedGraph,
}

/// Shadow state confined to one call frame.
struct FrameState {
    /// Storage context of the frame (`DELEGATECALL` keeps the caller's).
    address: Address,
    graph_index: usize,
    graph: DepGraph,
    sstack: ShadowStack,
    smemory: ShadowMemory,
    sstorage: ShadowStorage,
    rstack: ReducedStack,
    rmemory: ReducedMemory,
    cmemory: CachedMemory,
}

/// Operand snapshot taken at `step`, consumed at `step_end`. Call and
/// create instructions never produce one; they are done by then.
struct PendingOp {
    opcode: u8,
    gas_before: u64,
    stack_len: usize,
    /// Top-of-stack first, up to the opcode's input arity.
    operands: SmallVec<[U256; 8]>,
}

/// Bookkeeping for one outstanding call or create instruction.
struct CallMark {
    /// Frame-stack depth when the call was issued; anything above it at
    /// `call_end` belongs to the callee and gets finalized.
    frames_below: usize,
    /// Return-data region in the caller's memory (empty for creates).
    ret_offset: usize,
    ret_size: usize,
    snode: SNode,
    rnode: RId,
}

/// Reusable backing buffers handed to frames on entry and reclaimed on
/// exit.
#[derive(Default)]
struct BufferPool {
    sstacks: Vec<Vec<SNode>>,
    smemories: Vec<Vec<SNode>>,
    rstacks: Vec<Vec<RId>>,
}

pub struct TraceInspector {
    runtime: Arc<RuntimeTable>,
    frames: Vec<FrameState>,
    marks: Vec<CallMark>,
    graphs: Vec<Option<DepGraph>>,
    rgraph: ReducedGraph,
    rstorage: ReducedStorage,
    cstorage: CachedStorage,
    pool: BufferPool,
    /// Transaction-monotonic instruction counter.
    seq: i64,
    pending: Option<PendingOp>,
    /// Node captured at `step` for the next `call`/`create` hook.
    last_call: Option<(SNode, RId)>,
    /// First invariant violation observed; stops further instrumentation.
    violation: Option<AmdahlError>,
}

impl TraceInspector {
    pub fn new(runtime: Arc<RuntimeTable>) -> Self {
        Self {
            runtime,
            frames: Vec::new(),
            marks: Vec::new(),
            graphs: Vec::new(),
            rgraph: ReducedGraph::new(),
            rstorage: ReducedStorage::new(),
            cstorage: CachedStorage::new(),
            pool: BufferPool::default(),
            seq: 0,
            pending: None,
            last_call: None,
            violation: None,
        }
    }

    /// Finalize any frames still open (the outermost frame has no
    /// `call_end`), surface the first invariant violation, and hand the
    /// collected graphs to the analyses.
    pub fn finish(mut self) -> AmdahlResult<TraceOutput> {
        while !self.frames.is_empty() {
            self.finalize_top_frame();
        }
        if let Some(violation) = self.violation {
            return Err(violation);
        }
        Ok(TraceOutput {
            graphs: self.graphs,
            rgraph: self.rgraph,
        })
    }

    fn next_snode(&mut self, opcode: u8) -> SNode {
        let node = SNode::new(Op::Byte(opcode), self.seq);
        self.seq += 1;
        node
    }

    fn finalize_top_frame(&mut self) {
        let Some(frame) = self.frames.pop() else { return };
        let FrameState {
            graph_index,
            mut graph,
            sstack,
            smemory,
            rstack,
            ..
        } = frame;
        self.pool.sstacks.push(sstack.into_buffer());
        self.pool.smemories.push(smemory.into_buffer());
        self.pool.rstacks.push(rstack.into_buffer());

        if graph.edge_count() > 0 {
            match graph.init() {
                Ok(()) => self.graphs[graph_index] = Some(graph),
                Err(err) => self.record_violation(err),
            }
        }
    }

    fn record_violation(&mut self, err: AmdahlError) {
        if self.violation.is_none() {
            self.violation = Some(err);
        }
    }

    /// Call/create family, instrumented fully at `step`: consume the
    /// arguments, read the input memory range, create a never-reusable
    /// node, and pre-push it as the result the resumed frame will see.
    fn instrument_call_like(&mut self, opcode: u8, operands: &[U256]) {
        let snode = self.next_snode(opcode);
        let (in_off_idx, in_size_idx) = match opcode {
            op::CREATE | op::CREATE2 => (1, 2),
            op::DELEGATECALL | op::STATICCALL => (2, 3),
            // CALL | CALLCODE
            _ => (3, 4),
        };
        let in_offset = to_usize(&operands[in_off_idx]);
        let in_size = to_usize(&operands[in_size_idx]);
        let arity = operands.len();

        let Self {
            frames,
            rgraph,
            last_call,
            ..
        } = self;
        let Some(frame) = frames.last_mut() else { return };

        frame.graph.record_order(snode);
        frame.sstack.consume_n(arity, snode, &mut frame.graph);
        frame.smemory.get_ptr(in_offset, in_size, snode, &mut frame.graph);
        frame.sstack.push(snode);

        let deps = frame.rstack.consume_n(arity);
        let rnode = rgraph.add_new_node(Op::Byte(opcode), U256::ZERO, deps);
        frame.rstack.push(rnode);

        *last_call = Some((snode, rnode));
    }

    /// Close the bracket opened by a call or create: finalize callee
    /// frames, then (for calls) publish the returned bytes into the
    /// caller's memory under the call's own node.
    fn end_call_like(&mut self, mark: CallMark, output: Option<&[u8]>) {
        while self.frames.len() > mark.frames_below {
            self.finalize_top_frame();
        }
        let Some(output) = output else { return };
        let len = mark.ret_size.min(output.len());
        if len == 0 {
            return;
        }
        let Self { frames, rgraph, .. } = self;
        let Some(frame) = frames.last_mut() else { return };

        let end = mark.ret_offset + len;
        frame.smemory.resize(end, mark.snode);
        frame.rmemory.resize(end, rgraph);
        frame.cmemory.resize(end);

        frame
            .smemory
            .set(mark.ret_offset, len, mark.snode, &mut frame.graph);
        frame.rmemory.set(mark.ret_offset, len, mark.rnode);
        frame.cmemory.set(mark.ret_offset, &output[..len]);
    }
}

fn to_usize(value: &U256) -> usize {
    usize::try_from(*value).unwrap_or(usize::MAX)
}

fn is_call_like(opcode: u8) -> bool {
    matches!(
        opcode,
        op::CREATE | op::CREATE2 | op::CALL | op::CALLCODE | op::DELEGATECALL | op::STATICCALL
    )
}

impl<CTX> Inspector<CTX, EthInterpreter> for TraceInspector {
    fn initialize_interp(&mut self, interp: &mut Interpreter<EthInterpreter>, _context: &mut CTX) {
        let graph_index = self.graphs.len();
        self.graphs.push(None);
        self.frames.push(FrameState {
            address: interp.input.target_address(),
            graph_index,
            graph: DepGraph::new(self.runtime.clone()),
            sstack: ShadowStack::from_buffer(self.pool.sstacks.pop().unwrap_or_default()),
            smemory: ShadowMemory::from_buffer(self.pool.smemories.pop().unwrap_or_default()),
            sstorage: ShadowStorage::new(),
            rstack: ReducedStack::from_buffer(self.pool.rstacks.pop().unwrap_or_default()),
            rmemory: ReducedMemory::new(),
            cmemory: CachedMemory::new(),
        });
    }

    fn step(&mut self, interp: &mut Interpreter<EthInterpreter>, _context: &mut CTX) {
        self.pending = None;
        if self.violation.is_some() || self.frames.is_empty() {
            return;
        }

        let opcode = interp.bytecode.opcode();
        let (inputs, _) = op::stack_io(opcode);
        let stack = interp.stack.data();
        if stack.len() < inputs {
            // The instruction will fault; nothing to mirror.
            return;
        }
        let mut operands: SmallVec<[U256; 8]> = SmallVec::new();
        for i in 0..inputs {
            operands.push(stack[stack.len() - 1 - i]);
        }

        if is_call_like(opcode) {
            self.instrument_call_like(opcode, &operands);
            return;
        }

        self.pending = Some(PendingOp {
            opcode,
            gas_before: interp.gas.remaining(),
            stack_len: stack.len(),
            operands,
        });
    }

    fn step_end(&mut self, interp: &mut Interpreter<EthInterpreter>, _context: &mut CTX) {
        let Some(pending) = self.pending.take() else { return };
        if self.violation.is_some() {
            return;
        }

        let opcode = pending.opcode;
        let (inputs, outputs) = op::stack_io(opcode);
        let post_len = interp.stack.data().len();
        if post_len != pending.stack_len - inputs + outputs {
            // Faulted mid-instruction; the step never completed.
            return;
        }

        let snode = self.next_snode(opcode);
        let result = if outputs == 1 {
            interp.stack.data().last().copied().unwrap_or_default()
        } else {
            U256::ZERO
        };
        let gas_cost = pending.gas_before.saturating_sub(interp.gas.remaining());
        let operands = &pending.operands;

        // Split-borrow the inspector so frame state and the shared
        // transaction state can be touched together.
        let Self {
            frames,
            rgraph,
            rstorage,
            cstorage,
            ..
        } = self;
        let Some(frame) = frames.last_mut() else { return };

        // Keep the three memory mirrors in lockstep with the interpreter
        // before any range is touched.
        let mem_size = interp.memory.size();
        frame.smemory.resize(mem_size, snode);
        frame.rmemory.resize(mem_size, rgraph);
        frame.cmemory.resize(mem_size);

        frame.graph.record_order(snode);

        let mut mismatch: Option<&'static str> = None;
        match opcode {
            op::DUP1..=op::DUP16 => {
                let n = (opcode - op::DUP1 + 1) as usize;
                frame.sstack.dup(n, snode, &mut frame.graph);
                frame.rstack.dup(n);
            }
            op::SWAP1..=op::SWAP16 => {
                let n = (opcode - op::SWAP1 + 2) as usize;
                frame.sstack.swap(n, snode, &mut frame.graph);
                frame.rstack.swap(n);
            }
            op::POP => {
                frame.sstack.consume_n(1, snode, &mut frame.graph);
                frame.rstack.consume_n(1);
            }
            op::KECCAK256 => {
                let offset = to_usize(&operands[0]);
                let size = to_usize(&operands[1]);
                frame.sstack.consume_n(2, snode, &mut frame.graph);
                frame.smemory.get_ptr(offset, size, snode, &mut frame.graph);
                frame.sstack.push(snode);

                let mut deps = frame.rstack.consume_n(2);
                deps.extend(frame.rmemory.get_ptr(offset, size));
                let (rnode, reused) = rgraph.try_add(Op::Byte(opcode), result, deps);
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                }
                frame.rstack.push(rnode);
            }
            op::MLOAD => {
                let offset = to_usize(&operands[0]);
                rgraph.counts.mloads += 1;
                frame.sstack.consume_n(1, snode, &mut frame.graph);
                frame.smemory.get_ptr(offset, 32, snode, &mut frame.graph);
                frame.sstack.push(snode);

                let mut deps = frame.rstack.consume_n(1);
                deps.extend(frame.rmemory.get_ptr(offset, 32));
                let (rnode, reused) = rgraph.try_add(Op::Byte(opcode), result, deps);
                let cached = frame.cmemory.get(offset, &result.to_be_bytes::<32>());
                if cached {
                    rgraph.counts.mloads_cached += 1;
                }
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                    if !cached {
                        mismatch = Some("MLOAD");
                    }
                }
                frame.rstack.push(rnode);
            }
            op::MSTORE => {
                let offset = to_usize(&operands[0]);
                let value = operands[1];
                rgraph.counts.mstores += 1;
                frame.sstack.consume_n(2, snode, &mut frame.graph);
                frame.smemory.set32(offset, snode, &mut frame.graph);

                let deps = frame.rstack.consume_n(2);
                let (rnode, _) = rgraph.try_add(Op::Byte(opcode), U256::ZERO, deps);
                let reused = frame.rmemory.set32(offset, rnode);
                let cached = frame.cmemory.set(offset, &value.to_be_bytes::<32>());
                if cached {
                    rgraph.counts.mstores_cached += 1;
                }
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                    if !cached {
                        mismatch = Some("MSTORE");
                    }
                }
            }
            op::MSTORE8 => {
                let offset = to_usize(&operands[0]);
                let value = operands[1];
                rgraph.counts.mstore8s += 1;
                frame.sstack.consume_n(2, snode, &mut frame.graph);
                frame.smemory.set(offset, 1, snode, &mut frame.graph);

                let deps = frame.rstack.consume_n(2);
                let (rnode, _) = rgraph.try_add(Op::Byte(opcode), U256::ZERO, deps);
                let reused = frame.rmemory.set(offset, 1, rnode);
                let cached = frame.cmemory.set_byte(offset, value.byte(0));
                if cached {
                    rgraph.counts.mstore8s_cached += 1;
                }
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                    if !cached {
                        mismatch = Some("MSTORE8");
                    }
                }
            }
            op::CALLDATACOPY | op::CODECOPY | op::RETURNDATACOPY | op::EXTCODECOPY | op::MCOPY => {
                let (dst_idx, len_idx) = if opcode == op::EXTCODECOPY { (1, 3) } else { (0, 2) };
                let dst = to_usize(&operands[dst_idx]);
                let len = to_usize(&operands[len_idx]);
                frame.sstack.consume_n(inputs, snode, &mut frame.graph);
                if opcode == op::MCOPY {
                    let src = to_usize(&operands[1]);
                    frame.smemory.get_ptr(src, len, snode, &mut frame.graph);
                }
                frame.smemory.set(dst, len, snode, &mut frame.graph);

                let mut deps = frame.rstack.consume_n(inputs);
                if opcode == op::MCOPY {
                    let src = to_usize(&operands[1]);
                    deps.extend(frame.rmemory.get_ptr(src, len));
                }
                let (rnode, _) = rgraph.try_add(Op::Byte(opcode), U256::ZERO, deps);
                let reused = frame.rmemory.set(dst, len, rnode);
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                }
                if len > 0 {
                    let written = interp.memory.slice_len(dst, len).to_vec();
                    frame.cmemory.set(dst, &written);
                }
            }
            op::SLOAD => {
                let key = B256::from(operands[0]);
                let addr = frame.address;
                rgraph.counts.sloads += 1;
                frame.sstorage.get_state(addr, key, snode, &mut frame.graph);
                frame.sstack.consume_n(1, snode, &mut frame.graph);
                frame.sstack.push(snode);

                let mut deps = DepList::new();
                deps.push(rstorage.get_state(addr, key, rgraph));
                deps.extend(frame.rstack.consume_n(1));
                let (rnode, reused) = rgraph.try_add(Op::Byte(opcode), result, deps);
                let cached = cstorage.get(addr, key, B256::from(result));
                if cached {
                    rgraph.counts.sloads_cached += 1;
                }
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                    if !cached {
                        mismatch = Some("SLOAD");
                    }
                }
                frame.rstack.push(rnode);
            }
            op::SSTORE => {
                let key = B256::from(operands[0]);
                let value = B256::from(operands[1]);
                let addr = frame.address;
                rgraph.counts.sstores += 1;
                frame.sstack.consume_n(2, snode, &mut frame.graph);
                frame.sstorage.set_state(addr, key, snode, &mut frame.graph);

                let deps = frame.rstack.consume_n(2);
                let (rnode, _) = rgraph.try_add(Op::Byte(opcode), U256::ZERO, deps);
                let reused = rstorage.set_state(addr, key, rnode);
                let cached = cstorage.set(addr, key, value);
                if cached {
                    rgraph.counts.sstores_cached += 1;
                }
                if reused {
                    rgraph.record_redundancy(opcode, gas_cost);
                    if !cached {
                        mismatch = Some("SSTORE");
                    }
                }
            }
            op::LOG0..=op::LOG4 => {
                let offset = to_usize(&operands[0]);
                let size = to_usize(&operands[1]);
                frame.sstack.consume_n(inputs, snode, &mut frame.graph);
                frame.smemory.get_copy(offset, size, snode, &mut frame.graph);

                let mut deps = frame.rstack.consume_n(inputs);
                deps.extend(frame.rmemory.get_copy(offset, size));
                rgraph.try_add(Op::Byte(opcode), U256::ZERO, deps);
            }
            op::RETURN | op::REVERT => {
                let offset = to_usize(&operands[0]);
                let size = to_usize(&operands[1]);
                frame.sstack.consume_n(2, snode, &mut frame.graph);
                frame.smemory.get_ptr(offset, size, snode, &mut frame.graph);
                frame.rstack.consume_n(2);
            }
            op::GAS => {
                frame.sstack.push(snode);
                let rnode = rgraph.add_new_node(Op::Byte(opcode), result, DepList::new());
                frame.rstack.push(rnode);
            }
            _ => {
                // Data-driven fallback covering the pure opcode families:
                // arithmetic, comparisons, environment reads, pushes,
                // jumps, and terminators.
                debug_assert!(reusable(opcode), "non-reusable ops never reach the fallback");
                frame.sstack.consume_n(inputs, snode, &mut frame.graph);
                let deps = frame.rstack.consume_n(inputs);
                if outputs == 1 {
                    frame.sstack.push(snode);
                    let (rnode, reused) = rgraph.try_add(Op::Byte(opcode), result, deps);
                    if reused {
                        rgraph.record_redundancy(opcode, gas_cost);
                    }
                    frame.rstack.push(rnode);
                }
            }
        }

        if let Some(mismatched) = mismatch {
            self.record_violation(AmdahlError::ReuseMismatch { op: mismatched });
        }
    }

    fn call(&mut self, _context: &mut CTX, inputs: &mut CallInputs) -> Option<CallOutcome> {
        if let Some((snode, rnode)) = self.last_call.take() {
            self.marks.push(CallMark {
                frames_below: self.frames.len(),
                ret_offset: inputs.return_memory_offset.start,
                ret_size: inputs.return_memory_offset.len(),
                snode,
                rnode,
            });
        }
        None
    }

    fn call_end(&mut self, _context: &mut CTX, _inputs: &CallInputs, outcome: &mut CallOutcome) {
        if let Some(mark) = self.marks.pop() {
            let result = outcome.result.result;
            let output = if result.is_ok() || result.is_revert() {
                Some(outcome.result.output.as_ref())
            } else {
                None
            };
            self.end_call_like(mark, output);
        }
    }

    fn create(&mut self, _context: &mut CTX, _inputs: &mut CreateInputs) -> Option<CreateOutcome> {
        if let Some((snode, rnode)) = self.last_call.take() {
            self.marks.push(CallMark {
                frames_below: self.frames.len(),
                ret_offset: 0,
                ret_size: 0,
                snode,
                rnode,
            });
        }
        None
    }

    fn create_end(
        &mut self,
        _context: &mut CTX,
        _inputs: &CreateInputs,
        _outcome: &mut CreateOutcome,
    ) {
        if let Some(mark) = self.marks.pop() {
            self.end_call_like(mark, None);
        }
    }
}
