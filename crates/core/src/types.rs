//! Domain types for the amdahl profiler.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::opcode::Op;

// ---------------------------------------------------------------------------
// Dependency graph nodes
// ---------------------------------------------------------------------------

/// Identity of one executed instruction instance.
///
/// `seq` is a transaction-monotonic counter; negative values are reserved
/// for the synthetic `ROOT`/`DEST`/`NOP` nodes. Nodes are value-compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SNode {
    pub op: Op,
    pub seq: i64,
}

impl SNode {
    pub fn new(op: Op, seq: i64) -> Self {
        Self { op, seq }
    }
}

impl std::fmt::Display for SNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.op, self.seq)
    }
}

/// Classical data-dependence kinds, plus the two synthetic kinds the graph
/// post-processing introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// Read-after-write: the reader depends on the producer.
    Raw,
    /// Write-after-read: the overwrite must follow all readers.
    War,
    /// Write-after-write: the overwrite must follow the previous writer.
    Waw,
    /// Sequencing between adjacent basic blocks.
    Ctrl,
    /// Artificial root/sink link.
    Art,
}

impl std::fmt::Display for DepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DepKind::Raw => "RAW",
            DepKind::War => "WAR",
            DepKind::Waw => "WAW",
            DepKind::Ctrl => "CTRL",
            DepKind::Art => "ART",
        })
    }
}

// ---------------------------------------------------------------------------
// Substate records
// ---------------------------------------------------------------------------

/// Pre-state of one account as recorded for replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstateAccount {
    pub nonce: u64,
    pub balance: U256,
    #[serde(default)]
    pub code: Bytes,
    #[serde(default)]
    pub storage: BTreeMap<B256, B256>,
}

impl SubstateAccount {
    pub fn has_code(&self) -> bool {
        !self.code.is_empty()
    }
}

/// Block environment recorded alongside the transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstateEnv {
    pub coinbase: Address,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: U256,
    pub gas_limit: u64,
    #[serde(default)]
    pub base_fee: Option<U256>,
    /// Hashes observable through `BLOCKHASH` during the original execution.
    #[serde(default)]
    pub block_hashes: BTreeMap<u64, B256>,
}

/// The message applied to the pre-state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstateMessage {
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub value: U256,
    #[serde(default)]
    pub input: Bytes,
}

/// Self-contained record of everything needed to re-execute one
/// transaction in isolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Substate {
    pub input_alloc: BTreeMap<Address, SubstateAccount>,
    pub env: SubstateEnv,
    pub message: SubstateMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode;

    #[test]
    fn snode_identity_is_op_and_seq() {
        let a = SNode::new(Op::Byte(opcode::ADD), 3);
        let b = SNode::new(Op::Byte(opcode::ADD), 3);
        let c = SNode::new(Op::Byte(opcode::ADD), 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "ADD_3");
    }
}
