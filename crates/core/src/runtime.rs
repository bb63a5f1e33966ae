//! Estimated per-opcode runtime table used by the scheduling analyses.
//!
//! Cycle estimates follow the constant-gas schedule of the fork active at
//! the given block, so repricing hard-forks (Tangerine Whistle, Istanbul,
//! Berlin) shift the relative weight of state-access opcodes the same way
//! they shifted real execution cost. Only the dependency-graph analyses
//! interpret these values.

use crate::opcode::{self as op, Op};

/// Mainnet repricing boundaries relevant to the table.
pub const TANGERINE_WHISTLE_BLOCK: u64 = 2_463_000;
pub const ISTANBUL_BLOCK: u64 = 9_069_000;
pub const BERLIN_BLOCK: u64 = 12_244_000;

#[derive(Debug, Clone)]
pub struct RuntimeTable([u32; 256]);

impl RuntimeTable {
    /// Build the table for the fork active at `block`.
    pub fn for_block(block: u64) -> Self {
        let mut t = [0u32; 256];

        for b in [op::ADD, op::SUB, op::NOT, op::LT, op::GT, op::SLT, op::SGT, op::EQ] {
            t[b as usize] = 3;
        }
        for b in [op::ISZERO, op::AND, op::OR, op::XOR, op::BYTE, op::SHL, op::SHR, op::SAR] {
            t[b as usize] = 3;
        }
        for b in [op::MUL, op::DIV, op::SDIV, op::MOD, op::SMOD, op::SIGNEXTEND] {
            t[b as usize] = 5;
        }
        t[op::ADDMOD as usize] = 8;
        t[op::MULMOD as usize] = 8;
        t[op::EXP as usize] = 10;
        t[op::KECCAK256 as usize] = 30;

        for b in [
            op::ADDRESS,
            op::ORIGIN,
            op::CALLER,
            op::CALLVALUE,
            op::CALLDATASIZE,
            op::CODESIZE,
            op::GASPRICE,
            op::RETURNDATASIZE,
            op::COINBASE,
            op::TIMESTAMP,
            op::NUMBER,
            op::DIFFICULTY,
            op::GASLIMIT,
            op::CHAINID,
            op::BASEFEE,
            op::POP,
            op::PC,
            op::MSIZE,
            op::GAS,
        ] {
            t[b as usize] = 2;
        }
        for b in [op::CALLDATALOAD, op::CALLDATACOPY, op::CODECOPY, op::RETURNDATACOPY] {
            t[b as usize] = 3;
        }
        for b in [op::MLOAD, op::MSTORE, op::MSTORE8] {
            t[b as usize] = 3;
        }
        t[op::BLOCKHASH as usize] = 20;
        t[op::SELFBALANCE as usize] = 5;
        t[op::JUMP as usize] = 8;
        t[op::JUMPI as usize] = 10;
        t[op::JUMPDEST as usize] = 1;

        for b in op::PUSH0..=op::PUSH32 {
            t[b as usize] = 3;
        }
        for b in op::DUP1..=op::DUP16 {
            t[b as usize] = 3;
        }
        for b in op::SWAP1..=op::SWAP16 {
            t[b as usize] = 3;
        }
        for (i, b) in (op::LOG0..=op::LOG4).enumerate() {
            t[b as usize] = 375 * (i as u32 + 1);
        }

        t[op::CREATE as usize] = 32_000;
        t[op::CREATE2 as usize] = 32_000;
        t[op::SSTORE as usize] = 5_000;

        // Fork-dependent state access costs.
        let (sload, balance, extcode, extcodehash, call, selfdestruct) =
            if block >= BERLIN_BLOCK {
                (2_100, 2_600, 2_600, 2_600, 2_600, 5_000)
            } else if block >= ISTANBUL_BLOCK {
                (800, 700, 700, 700, 700, 5_000)
            } else if block >= TANGERINE_WHISTLE_BLOCK {
                (200, 400, 700, 400, 700, 5_000)
            } else {
                (50, 20, 20, 400, 40, 0)
            };
        t[op::SLOAD as usize] = sload;
        t[op::BALANCE as usize] = balance;
        t[op::EXTCODESIZE as usize] = extcode;
        t[op::EXTCODECOPY as usize] = extcode;
        t[op::EXTCODEHASH as usize] = extcodehash;
        for b in [op::CALL, op::CALLCODE, op::DELEGATECALL, op::STATICCALL] {
            t[b as usize] = call;
        }
        t[op::SELFDESTRUCT as usize] = selfdestruct;

        RuntimeTable(t)
    }

    /// Estimated cycles for a node tag. Synthetic tags cost nothing.
    pub fn get(&self, op: Op) -> u64 {
        match op {
            Op::Byte(b) => u64::from(self.0[b as usize]),
            Op::Nop | Op::Root | Op::Dest => 0,
        }
    }
}
