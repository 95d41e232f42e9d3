//! Sequence sharding across ring participants
//!
//! `Contiguous` gives rank r the r-th of P equal chunks. `Zigzag` cuts the
//! sequence into 2P blocks and gives rank r blocks r and 2P-1-r, so every
//! rank owns one early and one late block and the causal work per rank is
//! balanced. Ranges are ascending within a shard, and the shards of all ranks
//! partition `0..seq_len`.

use crate::config_error;
use crate::error::ForgeResult;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// How a sequence is distributed over P ranks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardLayout {
    #[default]
    Contiguous,
    Zigzag,
}

impl ShardLayout {
    /// Number of equal blocks the sequence is cut into
    pub fn divisor(&self, world_size: usize) -> usize {
        match self {
            ShardLayout::Contiguous => world_size,
            ShardLayout::Zigzag => 2 * world_size,
        }
    }

    pub fn validate(&self, seq_len: usize, world_size: usize) -> ForgeResult<()> {
        if world_size == 0 {
            return Err(config_error!("world size must be at least 1"));
        }
        let divisor = self.divisor(world_size);
        if seq_len == 0 || seq_len % divisor != 0 {
            return Err(config_error!(
                "{} layout needs seq_len divisible by {}, got {}",
                self,
                divisor,
                seq_len
            ));
        }
        Ok(())
    }

    /// Largest usable length not above `seq_len`
    pub fn truncate(&self, seq_len: usize, world_size: usize) -> usize {
        let divisor = self.divisor(world_size.max(1));
        (seq_len / divisor) * divisor
    }

    /// Ascending token ranges owned by `rank`
    pub fn ranges(&self, seq_len: usize, world_size: usize, rank: usize) -> ForgeResult<Vec<Range<usize>>> {
        self.validate(seq_len, world_size)?;
        if rank >= world_size {
            return Err(config_error!("rank {} outside world size {}", rank, world_size));
        }

        let block = seq_len / self.divisor(world_size);
        Ok(match self {
            ShardLayout::Contiguous => vec![rank * block..(rank + 1) * block],
            ShardLayout::Zigzag => {
                let mirror = 2 * world_size - 1 - rank;
                vec![rank * block..(rank + 1) * block, mirror * block..(mirror + 1) * block]
            }
        })
    }

    /// Global token positions owned by `rank`, ascending
    pub fn positions(&self, seq_len: usize, world_size: usize, rank: usize) -> ForgeResult<Vec<usize>> {
        Ok(self
            .ranges(seq_len, world_size, rank)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// `rank`'s shard of `tensor` along `axis`
    pub fn shard(&self, tensor: &Tensor, axis: usize, world_size: usize, rank: usize) -> ForgeResult<Tensor> {
        let seq_len = tensor
            .dims()
            .get(axis)
            .copied()
            .ok_or_else(|| config_error!("axis {} out of range for {}", axis, tensor.shape()))?;
        tensor.gather(axis, &self.ranges(seq_len, world_size, rank)?)
    }

    /// Reassemble the full tensor from every rank's shard, in rank order
    pub fn unshard(&self, shards: &[Tensor], axis: usize) -> ForgeResult<Tensor> {
        let world_size = shards.len();
        if world_size == 0 {
            return Err(config_error!("no shards to reassemble"));
        }

        match self {
            ShardLayout::Contiguous => Tensor::cat(&shards.iter().collect::<Vec<_>>(), axis),
            ShardLayout::Zigzag => {
                let mut blocks: Vec<Option<Tensor>> = vec![None; 2 * world_size];
                for (rank, shard) in shards.iter().enumerate() {
                    let halves = shard.chunk(2, axis)?;
                    let mut halves = halves.into_iter();
                    blocks[rank] = halves.next();
                    blocks[2 * world_size - 1 - rank] = halves.next();
                }
                let ordered: Vec<&Tensor> = blocks.iter().flatten().collect();
                if ordered.len() != 2 * world_size {
                    return Err(config_error!("zigzag shard did not split into two blocks"));
                }
                Tensor::cat(&ordered, axis)
            }
        }
    }
}

impl fmt::Display for ShardLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardLayout::Contiguous => write!(f, "contiguous"),
            ShardLayout::Zigzag => write!(f, "zigzag"),
        }
    }
}
