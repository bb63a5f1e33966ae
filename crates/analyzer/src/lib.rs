//! Replay instrumentation engine: dependency DAG, reduced value DAG,
//! shadow state, the revm trace inspector, scheduling analyses, and the
//! block-parallel trace driver.

pub mod dep_graph;
pub mod driver;
pub mod inspector;
pub mod reduced_graph;
pub mod replayer;
pub mod report;
pub mod shadow;
pub mod value_cache;

pub use driver::{TaskFilter, TaskPool, TraceKind};
pub use inspector::{TraceInspector, TraceOutput};
pub use replayer::trace_transaction;
