//! Substate archive access: the read-only store interface, its
//! directory-backed implementation, and the revm database adapter used to
//! replay one recorded transaction.

pub mod db;
pub mod store;

pub use db::{ReplayDb, ReplayDbError};
pub use store::{DirStore, SubstateStore};
