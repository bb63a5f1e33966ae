//! Domain models, opcode metadata, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod error;
pub mod opcode;
pub mod runtime;
pub mod types;

pub use error::{AmdahlError, AmdahlResult};
pub use opcode::Op;
pub use runtime::RuntimeTable;
pub use types::{
    DepKind, SNode, Substate, SubstateAccount, SubstateEnv, SubstateMessage,
};
