//! revm database adapter over one recorded substate.
//!
//! Reads resolve exclusively against the recorded pre-state: accounts and
//! storage come from the input allocation, `BLOCKHASH` from the recorded
//! hash map. Anything the original execution never touched is absent by
//! construction, so a miss on a block hash is an error rather than a
//! fabricated value.

use alloy_primitives::{Address, B256, U256};
use amdahl_core::Substate;
use revm::database_interface::{DBErrorMarker, DatabaseRef};
use revm::primitives::KECCAK_EMPTY;
use revm::state::{AccountInfo, Bytecode};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayDbError {
    #[error("blockhash for block {0} invoked but not recorded")]
    MissingBlockHash(u64),

    #[error("code hash {0} not present in the input allocation")]
    UnknownCodeHash(B256),
}

impl DBErrorMarker for ReplayDbError {}

/// Immutable view of one substate, usable as the bottom layer of a
/// `CacheDB`.
pub struct ReplayDb<'a> {
    substate: &'a Substate,
    code_by_hash: HashMap<B256, Bytecode>,
}

impl<'a> ReplayDb<'a> {
    pub fn new(substate: &'a Substate) -> Self {
        let mut code_by_hash = HashMap::new();
        for account in substate.input_alloc.values() {
            if account.has_code() {
                let bytecode = Bytecode::new_raw(account.code.clone());
                code_by_hash.insert(bytecode.hash_slow(), bytecode);
            }
        }
        Self {
            substate,
            code_by_hash,
        }
    }
}

impl DatabaseRef for ReplayDb<'_> {
    type Error = ReplayDbError;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        Ok(self.substate.input_alloc.get(&address).map(|account| {
            if account.has_code() {
                let bytecode = Bytecode::new_raw(account.code.clone());
                let code_hash = bytecode.hash_slow();
                AccountInfo::new(account.balance, account.nonce, code_hash, bytecode)
            } else {
                AccountInfo::new(account.balance, account.nonce, KECCAK_EMPTY, Bytecode::new())
            }
        }))
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::new());
        }
        self.code_by_hash
            .get(&code_hash)
            .cloned()
            .ok_or(ReplayDbError::UnknownCodeHash(code_hash))
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        let key = B256::from(index);
        let value = self
            .substate
            .input_alloc
            .get(&address)
            .and_then(|account| account.storage.get(&key))
            .copied()
            .unwrap_or_default();
        Ok(U256::from_be_bytes(value.0))
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        self.substate
            .env
            .block_hashes
            .get(&number)
            .copied()
            .ok_or(ReplayDbError::MissingBlockHash(number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;
    use amdahl_core::SubstateAccount;

    fn substate_with_account() -> Substate {
        let mut substate = Substate::default();
        substate.input_alloc.insert(
            Address::with_last_byte(1),
            SubstateAccount {
                nonce: 3,
                balance: U256::from(1_000u64),
                code: Bytes::from_static(&[0x60, 0x01, 0x00]),
                storage: [(B256::with_last_byte(5), B256::with_last_byte(9))]
                    .into_iter()
                    .collect(),
            },
        );
        substate.env.block_hashes.insert(100, B256::repeat_byte(0xab));
        substate
    }

    #[test]
    fn accounts_resolve_from_the_allocation() {
        let substate = substate_with_account();
        let db = ReplayDb::new(&substate);

        let info = db.basic_ref(Address::with_last_byte(1)).unwrap().unwrap();
        assert_eq!(info.nonce, 3);
        assert_ne!(info.code_hash, KECCAK_EMPTY);
        assert!(db.basic_ref(Address::with_last_byte(2)).unwrap().is_none());

        let code = db.code_by_hash_ref(info.code_hash).unwrap();
        assert_eq!(code.original_byte_slice(), &[0x60, 0x01, 0x00]);
    }

    #[test]
    fn storage_defaults_to_zero() {
        let substate = substate_with_account();
        let db = ReplayDb::new(&substate);
        let addr = Address::with_last_byte(1);

        assert_eq!(db.storage_ref(addr, U256::from(5)).unwrap(), U256::from(9));
        assert_eq!(db.storage_ref(addr, U256::from(6)).unwrap(), U256::ZERO);
        assert_eq!(
            db.storage_ref(Address::with_last_byte(9), U256::ZERO).unwrap(),
            U256::ZERO
        );
    }

    #[test]
    fn block_hashes_must_be_recorded() {
        let substate = substate_with_account();
        let db = ReplayDb::new(&substate);
        assert_eq!(db.block_hash_ref(100).unwrap(), B256::repeat_byte(0xab));
        assert_eq!(
            db.block_hash_ref(101),
            Err(ReplayDbError::MissingBlockHash(101))
        );
    }
}
