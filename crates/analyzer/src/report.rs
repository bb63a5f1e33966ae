//! Typed CSV rows for the two trace outputs.
//!
//! Rows format themselves through `Display`; the collector adds one line
//! per row to the block's output file.

use amdahl_core::{opcode, AmdahlResult};

use crate::inspector::TraceOutput;

/// One row per non-empty call-frame graph of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyRow {
    pub block: u64,
    pub tx: usize,
    pub graph_index: usize,
    pub max_level: u64,
    pub frac: f64,
    pub required_processors: u64,
    pub max_runtime: u64,
    pub speedup: f64,
    pub cpu2: u64,
    pub cpu4: u64,
    pub cpu8: u64,
}

impl std::fmt::Display for DependencyRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{:.6},{},{},{:.6},{},{},{}",
            self.block,
            self.tx,
            self.graph_index,
            self.max_level,
            self.frac,
            self.required_processors,
            self.max_runtime,
            self.speedup,
            self.cpu2,
            self.cpu4,
            self.cpu8,
        )
    }
}

/// Run every scheduling analysis over the transaction's finalized frame
/// graphs. Frames that produced no edges have no row.
pub fn dependency_rows(
    block: u64,
    tx: usize,
    output: &TraceOutput,
) -> AmdahlResult<Vec<DependencyRow>> {
    let mut rows = Vec::new();
    for (graph_index, graph) in output.graphs.iter().enumerate() {
        let Some(graph) = graph else { continue };
        let level = graph.naive_parallelisation_level()?;
        let empirical = graph.naive_parallelisation_empirical()?;
        rows.push(DependencyRow {
            block,
            tx,
            graph_index,
            max_level: level.max_level,
            frac: level.frac,
            required_processors: level.required_processors,
            max_runtime: empirical.max_runtime,
            speedup: empirical.speedup,
            cpu2: graph.cp_list_scheduling(2)?,
            cpu4: graph.cp_list_scheduling(4)?,
            cpu8: graph.cp_list_scheduling(8)?,
        });
    }
    Ok(rows)
}

/// One row per transaction touching memory or storage: totals, reuse
/// counts, cache hits, and reused gas for the five op families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedundancyRow {
    pub block: u64,
    pub tx: usize,
    pub sloads: u64,
    pub sloads_reused: u64,
    pub sloads_cached: u64,
    pub sloads_gas: u64,
    pub sstores: u64,
    pub sstores_reused: u64,
    pub sstores_cached: u64,
    pub sstores_gas: u64,
    pub mloads: u64,
    pub mloads_reused: u64,
    pub mloads_cached: u64,
    pub mloads_gas: u64,
    pub mstores: u64,
    pub mstores_reused: u64,
    pub mstores_cached: u64,
    pub mstores_gas: u64,
    pub mstore8s: u64,
    pub mstore8s_reused: u64,
    pub mstore8s_cached: u64,
    pub mstore8s_gas: u64,
}

/// `None` when the transaction performed no memory or storage operation.
pub fn redundancy_row(block: u64, tx: usize, output: &TraceOutput) -> Option<RedundancyRow> {
    let counts = &output.rgraph.counts;
    if counts.is_empty() {
        return None;
    }
    let (sloads_reused, sloads_gas) = output.rgraph.redundancy(opcode::SLOAD);
    let (sstores_reused, sstores_gas) = output.rgraph.redundancy(opcode::SSTORE);
    let (mloads_reused, mloads_gas) = output.rgraph.redundancy(opcode::MLOAD);
    let (mstores_reused, mstores_gas) = output.rgraph.redundancy(opcode::MSTORE);
    let (mstore8s_reused, mstore8s_gas) = output.rgraph.redundancy(opcode::MSTORE8);
    Some(RedundancyRow {
        block,
        tx,
        sloads: counts.sloads,
        sloads_reused,
        sloads_cached: counts.sloads_cached,
        sloads_gas,
        sstores: counts.sstores,
        sstores_reused,
        sstores_cached: counts.sstores_cached,
        sstores_gas,
        mloads: counts.mloads,
        mloads_reused,
        mloads_cached: counts.mloads_cached,
        mloads_gas,
        mstores: counts.mstores,
        mstores_reused,
        mstores_cached: counts.mstores_cached,
        mstores_gas,
        mstore8s: counts.mstore8s,
        mstore8s_reused,
        mstore8s_cached: counts.mstore8s_cached,
        mstore8s_gas,
    })
}

impl std::fmt::Display for RedundancyRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.block,
            self.tx,
            self.sloads,
            self.sloads_reused,
            self.sloads_cached,
            self.sloads_gas,
            self.sstores,
            self.sstores_reused,
            self.sstores_cached,
            self.sstores_gas,
            self.mloads,
            self.mloads_reused,
            self.mloads_cached,
            self.mloads_gas,
            self.mstores,
            self.mstores_reused,
            self.mstores_cached,
            self.mstores_gas,
            self.mstore8s,
            self.mstore8s_reused,
            self.mstore8s_cached,
            self.mstore8s_gas,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundancy_row_formats_twenty_two_fields() {
        let row = RedundancyRow {
            block: 1,
            tx: 2,
            sloads: 3,
            sloads_reused: 1,
            sloads_cached: 2,
            sloads_gas: 600,
            sstores: 0,
            sstores_reused: 0,
            sstores_cached: 0,
            sstores_gas: 0,
            mloads: 4,
            mloads_reused: 2,
            mloads_cached: 3,
            mloads_gas: 6,
            mstores: 0,
            mstores_reused: 0,
            mstores_cached: 0,
            mstores_gas: 0,
            mstore8s: 0,
            mstore8s_reused: 0,
            mstore8s_cached: 0,
            mstore8s_gas: 0,
        };
        let line = row.to_string();
        assert_eq!(line.split(',').count(), 22);
        assert!(line.starts_with("1,2,3,1,2,600,"));
    }

    #[test]
    fn dependency_row_formats_eleven_fields() {
        let row = DependencyRow {
            block: 46_147,
            tx: 0,
            graph_index: 0,
            max_level: 12,
            frac: 0.25,
            required_processors: 4,
            max_runtime: 300,
            speedup: 0.5,
            cpu2: 500,
            cpu4: 400,
            cpu8: 350,
        };
        let line = row.to_string();
        assert_eq!(line.split(',').count(), 11);
        assert!(line.starts_with("46147,0,0,12,0.250000,4,300,0.500000,"));
    }
}
