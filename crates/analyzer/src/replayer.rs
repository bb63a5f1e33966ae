//! Replays one recorded transaction through revm with the trace
//! inspector attached.
//!
//! The replay is deliberately validation-light: nonces and balances come
//! from the recorded pre-state, base-fee and block-gas-limit rules
//! post-date most of the profiled range, and the instrumentation must
//! never influence the state transition itself.

use alloy_primitives::{B256, U256};
use amdahl_core::{AmdahlError, AmdahlResult, RuntimeTable, Substate};
use amdahl_substate::{ReplayDb, ReplayDbError};
use revm::context::result::EVMError;
use revm::context::{BlockEnv, Context, TxEnv};
use revm::database::CacheDB;
use revm::handler::{MainBuilder, MainContext};
use revm::inspector::InspectEvm;
use revm::primitives::hardfork::SpecId;
use revm::primitives::TxKind;
use std::sync::Arc;

use crate::inspector::{TraceInspector, TraceOutput};

/// Mainnet fork schedule by block number. The DAO fork never applies an
/// irregular state change here: replay state comes solely from the
/// recorded substate.
fn spec_for_block(number: u64) -> SpecId {
    match number {
        n if n >= 15_537_394 => SpecId::MERGE,
        n if n >= 13_773_000 => SpecId::ARROW_GLACIER,
        n if n >= 12_965_000 => SpecId::LONDON,
        n if n >= 12_244_000 => SpecId::BERLIN,
        n if n >= 9_200_000 => SpecId::MUIR_GLACIER,
        n if n >= 9_069_000 => SpecId::ISTANBUL,
        n if n >= 7_280_000 => SpecId::PETERSBURG,
        n if n >= 4_370_000 => SpecId::BYZANTIUM,
        n if n >= 2_675_000 => SpecId::SPURIOUS_DRAGON,
        n if n >= 2_463_000 => SpecId::TANGERINE,
        n if n >= 1_150_000 => SpecId::HOMESTEAD,
        _ => SpecId::FRONTIER,
    }
}

fn block_env(substate: &Substate) -> BlockEnv {
    let env = &substate.env;
    BlockEnv {
        number: U256::from(env.number),
        beneficiary: env.coinbase,
        timestamp: U256::from(env.timestamp),
        gas_limit: env.gas_limit,
        basefee: env
            .base_fee
            .map(|fee| fee.saturating_to::<u64>())
            .unwrap_or_default(),
        difficulty: env.difficulty,
        prevrandao: Some(B256::from(env.difficulty)),
        ..BlockEnv::default()
    }
}

fn tx_env(substate: &Substate) -> AmdahlResult<TxEnv> {
    let msg = &substate.message;
    TxEnv::builder()
        .caller(msg.from)
        .kind(match msg.to {
            Some(addr) => TxKind::Call(addr),
            None => TxKind::Create,
        })
        .nonce(msg.nonce)
        .gas_price(msg.gas_price.saturating_to::<u128>())
        .gas_limit(msg.gas)
        .value(msg.value)
        .data(msg.input.clone())
        .build()
        .map_err(|err| AmdahlError::EvmExecution(format!("building tx env: {err:?}")))
}

/// Replay one transaction and return the traced graphs. The dependency
/// and reduction data of a failed application are discarded with it.
pub fn trace_transaction(substate: &Substate) -> AmdahlResult<TraceOutput> {
    let runtime = Arc::new(RuntimeTable::for_block(substate.env.number));
    let inspector = TraceInspector::new(runtime.clone());
    let tx = tx_env(substate)?;

    let mut ctx = Context::mainnet()
        .with_db(CacheDB::new(ReplayDb::new(substate)))
        .with_block(block_env(substate));

    ctx.cfg.spec = spec_for_block(substate.env.number);
    // Recorded transactions predate (or were validated under) other
    // rules; execution must reach the bytecode regardless.
    ctx.cfg.disable_nonce_check = true;
    ctx.cfg.disable_balance_check = true;
    ctx.cfg.disable_block_gas_limit = true;
    ctx.cfg.disable_base_fee = true;
    ctx.cfg.disable_eip3607 = true;

    let mut evm = ctx.build_mainnet_with_inspector(inspector);

    match evm.inspect_one_tx(tx) {
        Ok(result) => {
            tracing::debug!(
                block = substate.env.number,
                gas_used = result.gas_used(),
                "replayed transaction"
            );
        }
        Err(EVMError::Database(ReplayDbError::MissingBlockHash(number))) => {
            return Err(AmdahlError::MissingBlockHash(number));
        }
        Err(err) => {
            return Err(AmdahlError::EvmExecution(format!("{err:?}")));
        }
    }

    let inspector = std::mem::replace(&mut evm.inspector, TraceInspector::new(runtime));
    inspector.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_schedule_matches_boundaries() {
        assert_eq!(spec_for_block(0), SpecId::FRONTIER);
        assert_eq!(spec_for_block(1_149_999), SpecId::FRONTIER);
        assert_eq!(spec_for_block(1_150_000), SpecId::HOMESTEAD);
        assert_eq!(spec_for_block(2_463_000), SpecId::TANGERINE);
        assert_eq!(spec_for_block(9_069_000), SpecId::ISTANBUL);
        assert_eq!(spec_for_block(12_244_000), SpecId::BERLIN);
        assert_eq!(spec_for_block(16_000_000), SpecId::MERGE);
    }

    #[test]
    fn base_fee_defaults_to_zero_pre_london() {
        let substate = Substate::default();
        assert_eq!(block_env(&substate).basefee, 0);
    }
}
