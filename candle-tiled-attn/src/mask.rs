//! Boundary, causal and dropout masks.
//!
//! Boundary and causal masks act on the scaled scores (disallowed entries become
//! `-inf`). The dropout mask acts on the exponentials and is a pure function of the
//! entry coordinates, so it does not depend on how the problem is tiled.
use serde::{Deserialize, Serialize};

use crate::philox::philox_uniform;

pub const DEFAULT_PHILOX_SEED: u64 = 0x1BF52;
pub const DEFAULT_PHILOX_OFFSET: u64 = 0x1D4B42;

fn default_seed() -> u64 {
    DEFAULT_PHILOX_SEED
}

fn default_offset() -> u64 {
    DEFAULT_PHILOX_OFFSET
}

/// Dropout probability together with the Philox stream that drives the keep mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    /// Probability of dropping an attention weight, in `[0, 1)`.
    pub p: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_offset")]
    pub offset: u64,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl DropoutConfig {
    pub fn new(p: f32) -> Self {
        Self {
            p,
            seed: DEFAULT_PHILOX_SEED,
            offset: DEFAULT_PHILOX_OFFSET,
        }
    }

    pub fn with_seed(self, seed: u64, offset: u64) -> Self {
        Self {
            seed,
            offset,
            ..self
        }
    }

    pub fn is_active(&self) -> bool {
        self.p > 0.0
    }

    /// Whether the entry with Philox counter `counter` survives.
    #[inline]
    pub fn keep(&self, counter: u64) -> bool {
        philox_uniform(self.seed, counter) > self.p
    }
}

/// Dropout keep mask for a single `(batch, query head)` attention matrix.
///
/// The counter of entry `(row, col)` is
/// `offset + ((batch * num_heads_q + head) * max_seqlen_q + row) * max_seqlen_k + col`,
/// rows and columns being positions inside the sequence.
#[derive(Debug, Clone, Copy)]
pub struct DropoutMask {
    cfg: DropoutConfig,
    base: u64,
    row_stride: u64,
}

impl DropoutMask {
    pub fn new(
        cfg: DropoutConfig,
        batch: usize,
        head: usize,
        num_heads_q: usize,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
    ) -> Self {
        let matrix = (batch as u64 * num_heads_q as u64 + head as u64)
            .wrapping_mul(max_seqlen_q as u64)
            .wrapping_mul(max_seqlen_k as u64);
        Self {
            cfg,
            base: cfg.offset.wrapping_add(matrix),
            row_stride: max_seqlen_k as u64,
        }
    }

    #[inline]
    pub fn counter(&self, row: usize, col: usize) -> u64 {
        self.base
            .wrapping_add((row as u64).wrapping_mul(self.row_stride))
            .wrapping_add(col as u64)
    }

    #[inline]
    pub fn keep(&self, row: usize, col: usize) -> bool {
        self.cfg.keep(self.counter(row, col))
    }

    pub fn p(&self) -> f32 {
        self.cfg.p
    }
}

/// Score masking for the attention matrix of one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreMask {
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub causal: bool,
}

impl ScoreMask {
    /// Whether query `row` may attend to key `col`.
    ///
    /// With `seqlen_q != seqlen_k` the causal diagonal is aligned to the bottom-right
    /// corner: row `i` sees keys `0..=i + seqlen_k - seqlen_q`.
    #[inline]
    pub fn allowed(&self, row: usize, col: usize) -> bool {
        if col >= self.seqlen_k {
            return false;
        }
        !self.causal || col as i64 <= row as i64 + self.seqlen_k as i64 - self.seqlen_q as i64
    }

    /// Rows before this index see no key at all under the causal mask.
    pub fn first_visible_row(&self) -> usize {
        if self.causal {
            self.seqlen_q.saturating_sub(self.seqlen_k)
        } else {
            0
        }
    }

    /// Sets the disallowed entries of a row-major `(rows, block_n)` score tile to `-inf`.
    ///
    /// `row_start` and `col_start` are the sequence positions of the tile origin.
    pub fn apply(
        &self,
        scores: &mut [f32],
        rows: usize,
        block_n: usize,
        row_start: usize,
        col_start: usize,
    ) {
        for i in 0..rows {
            let row = &mut scores[i * block_n..(i + 1) * block_n];
            for (j, s) in row.iter_mut().enumerate() {
                if !self.allowed(row_start + i, col_start + j) {
                    *s = f32::NEG_INFINITY;
                }
            }
        }
    }
}
