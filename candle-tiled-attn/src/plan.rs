//! Key-tile planning for one query tile.
//!
//! The visited key tiles are split into a leading run that needs no per-entry masking
//! and a trailing run that does (ragged key tail, causal diagonal). Skipping the masks on
//! the leading run gives exactly the same scores as masking every tile, because no entry
//! of a full tile is ever disallowed.

use std::ops::Range;

#[inline]
fn cdiv(x: i64, y: i64) -> i64 {
    if x <= 0 {
        // Only the sign matters to callers for non-positive numerators.
        x / y
    } else {
        (x + y - 1) / y
    }
}

/// Inputs of the planner for one `(query tile, batch)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanParams {
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    /// Index of the query tile, its first row is `tile_m * block_m`.
    pub tile_m: usize,
    pub block_m: usize,
    pub block_n: usize,
    pub causal: bool,
}

/// Visiting schedule of the key tiles for one query tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    /// Number of key tiles visited, starting from key tile 0.
    pub n_blocks: usize,
    /// Number of trailing visited tiles that need per-entry masking.
    pub masked_blocks: usize,
    /// Ragged remainder of the key sequence, 0 when `seqlen_k` is a multiple of `block_n`.
    pub n_extra_tokens: usize,
}

/// Outcome of planning a query tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// No key is reachable from any row of the tile, the tile is written as zeros.
    Empty,
    Tiles(TilePlan),
}

impl TilePlan {
    /// Builds the full/masked split for a query tile.
    pub fn new(p: &PlanParams) -> Plan {
        let total_blocks = p.seqlen_k.div_ceil(p.block_n);
        let mut n_blocks = total_blocks as i64;
        if p.causal {
            let reach =
                ((p.tile_m + 1) * p.block_m) as i64 + p.seqlen_k as i64 - p.seqlen_q as i64;
            n_blocks = n_blocks.min(cdiv(reach, p.block_n as i64));
        }
        if n_blocks <= 0 {
            return Plan::Empty;
        }
        let n_blocks = n_blocks as usize;
        let n_extra_tokens = Self::extra_tokens(p.seqlen_k, p.block_n);

        let mut n_full = n_blocks;
        if n_extra_tokens != 0 {
            // The last key tile carries columns past the end of the sequence.
            n_full = n_full.min(total_blocks - 1);
        }
        if p.causal {
            // First key column hidden from the first row of the tile, every later row
            // sees at least as many columns.
            let first_hidden = (p.tile_m * p.block_m) as i64 + p.seqlen_k as i64
                - p.seqlen_q as i64
                + 1;
            n_full = n_full.min(first_hidden.max(0) as usize / p.block_n);
        }
        Plan::Tiles(Self {
            n_blocks,
            masked_blocks: n_blocks - n_full,
            n_extra_tokens,
        })
    }

    /// Same tiles as [`TilePlan::new`] but with masking applied to every visited tile.
    pub fn uniform(p: &PlanParams) -> Plan {
        match Self::new(p) {
            Plan::Empty => Plan::Empty,
            Plan::Tiles(plan) => Plan::Tiles(Self {
                masked_blocks: plan.n_blocks,
                ..plan
            }),
        }
    }

    /// Ragged remainder of a key sequence.
    pub fn extra_tokens(seqlen_k: usize, block_n: usize) -> usize {
        if seqlen_k < block_n {
            block_n - seqlen_k
        } else {
            seqlen_k % block_n
        }
    }

    pub fn n_full(&self) -> usize {
        self.n_blocks - self.masked_blocks
    }

    /// Key tiles visited without masking.
    pub fn full_tiles(&self) -> Range<usize> {
        0..self.n_full()
    }

    /// Key tiles visited with the boundary/causal masks enabled.
    pub fn masked_tiles(&self) -> Range<usize> {
        self.n_full()..self.n_blocks
    }
}
