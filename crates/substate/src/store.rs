//! Read-only access to a recorded substate archive.
//!
//! One JSON file per block, named `<root>/<block>.json`, mapping the
//! transaction index to its [`Substate`]. A missing file is a block with
//! no recorded transactions, which is common across sparse early ranges.

use amdahl_core::{AmdahlError, AmdahlResult, Substate};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The one interface the trace driver consumes.
pub trait SubstateStore: Send + Sync {
    /// All recorded substates of `block`, keyed by transaction index.
    fn block_substates(&self, block: u64) -> AmdahlResult<BTreeMap<usize, Substate>>;
}

/// Directory-backed archive, opened once per run.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open_read_only(root: impl AsRef<Path>) -> AmdahlResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(AmdahlError::SubstateAccess(format!(
                "substate directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self { root })
    }
}

impl SubstateStore for DirStore {
    fn block_substates(&self, block: u64) -> AmdahlResult<BTreeMap<usize, Substate>> {
        let path = self.root.join(format!("{block}.json"));
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => {
                return Err(AmdahlError::SubstateAccess(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&data).map_err(|err| {
            AmdahlError::SubstateAccess(format!("decoding {}: {err}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amdahl_core::{SubstateEnv, SubstateMessage};

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("nope");
        assert!(matches!(
            DirStore::open_read_only(&bogus),
            Err(AmdahlError::SubstateAccess(_))
        ));
    }

    #[test]
    fn missing_block_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open_read_only(dir.path()).unwrap();
        assert!(store.block_substates(12_345).unwrap().is_empty());
    }

    #[test]
    fn block_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let substate = Substate {
            env: SubstateEnv {
                number: 46_147,
                gas_limit: 21_000,
                ..Default::default()
            },
            message: SubstateMessage {
                gas: 21_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let blob = serde_json::to_vec(&BTreeMap::from([(0usize, substate)])).unwrap();
        std::fs::write(dir.path().join("46147.json"), blob).unwrap();

        let store = DirStore::open_read_only(dir.path()).unwrap();
        let substates = store.block_substates(46_147).unwrap();
        assert_eq!(substates.len(), 1);
        assert_eq!(substates[&0].env.number, 46_147);
    }

    #[test]
    fn corrupt_block_file_surfaces_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7.json"), b"not json").unwrap();
        let store = DirStore::open_read_only(dir.path()).unwrap();
        assert!(matches!(
            store.block_substates(7),
            Err(AmdahlError::SubstateAccess(_))
        ));
    }
}
