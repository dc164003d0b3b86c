//! Partition ownership and partition-affine execution.

mod executor;
mod table;

pub use executor::{PartitionContext, PartitionExecutor, PartitionTask};
pub use table::{PartitionTable, PartitionTableEntry};
