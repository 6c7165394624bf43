//! Work-item orchestration and the parallel launch.
//!
//! A work item is one `(query tile, query head, batch)` triple. Each item plans its key
//! tiles, streams them through the online softmax and returns its own output tile; the
//! tiles are written into the output buffers once the parallel phase is over.

use std::f32::consts::LOG2_E;
use std::sync::LazyLock;

use candle::WithDType;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::TileConfig;
use crate::heads::HeadGroups;
use crate::mask::{DropoutConfig, DropoutMask, ScoreMask};
use crate::plan::{Plan, PlanParams, TilePlan};
use crate::seqlens::{SeqBounds, SeqLens};
use crate::softmax::RunningStats;
use crate::tile::TileView;

static FLASH_ATTN_POOL: LazyLock<ThreadPool> = LazyLock::new(|| {
    rayon::ThreadPoolBuilder::new()
        .thread_name(|i| format!("tiled-attn-{i}"))
        .build()
        .expect("Failed to build Rayon thread-pool for tiled attention")
});

const DOT_CHUNK: usize = 4;

#[inline]
fn vec_dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0f32;
    let chunks = a.len() / DOT_CHUNK;
    for i in 0..chunks {
        let i_chunk = i * DOT_CHUNK;
        sum += a[i_chunk] * b[i_chunk]
            + a[i_chunk + 1] * b[i_chunk + 1]
            + a[i_chunk + 2] * b[i_chunk + 2]
            + a[i_chunk + 3] * b[i_chunk + 3];
    }
    for i in (chunks * DOT_CHUNK)..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// A flat input buffer with its element strides along `(batch, head, token, dim)`.
///
/// Packed tensors have a zero batch stride, their sequences are located through the start
/// token instead. Broadcast bias dimensions also carry a zero stride.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a, T> {
    pub data: &'a [T],
    pub strides: [usize; 4],
}

impl<'a, T> Operand<'a, T> {
    pub fn new(data: &'a [T], strides: [usize; 4]) -> Self {
        Self { data, strides }
    }

    /// View over the `(shape.0, shape.1)` matrix of `(batch, head)` starting at token
    /// `start`, positioned at `offsets` with a `block` window.
    fn view(
        &self,
        batch: usize,
        head: usize,
        start: usize,
        shape: (usize, usize),
        offsets: (usize, usize),
        block: (usize, usize),
    ) -> TileView {
        let [s_b, s_h, s_t, s_d] = self.strides;
        TileView::new(
            batch * s_b + head * s_h + start * s_t,
            shape,
            (s_t, s_d),
            offsets,
            block,
        )
    }
}

/// Everything a launch needs besides the input buffers.
#[derive(Debug, Clone)]
pub struct Problem {
    pub batch: usize,
    pub heads: HeadGroups,
    pub head_size: usize,
    /// `head_size` rounded up to a supported width, tiles are this wide.
    pub padded_head_dim: usize,
    pub seqlens: SeqLens,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    /// Number of query tokens of the output buffer (`batch * max_seqlen_q` when fixed).
    pub total_q: usize,
    pub causal: bool,
    pub softmax_scale: f32,
    pub dropout: Option<DropoutConfig>,
    pub tiles: TileConfig,
    pub return_encoded_softmax: bool,
    /// Apply the score masks on every visited key tile.
    pub mask_every_tile: bool,
}

impl Problem {
    fn num_m_tiles(&self) -> usize {
        self.max_seqlen_q.div_ceil(self.tiles.block_m)
    }

    /// Offset of the first output row of `(batch, head)` and the stride between rows.
    fn out_rows(&self, batch: usize, head: usize, bounds: &SeqBounds) -> (usize, usize) {
        let d = self.head_size;
        let hq = self.heads.num_heads_q;
        if self.seqlens.is_packed() {
            (bounds.start_q * hq * d + head * d, hq * d)
        } else {
            ((batch * hq + head) * self.max_seqlen_q * d, d)
        }
    }

    fn row_index(&self, batch: usize, head: usize, row: usize) -> usize {
        (batch * self.heads.num_heads_q + head) * self.max_seqlen_q + row
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkItem {
    tile_m: usize,
    head: usize,
    batch: usize,
}

#[derive(Debug)]
struct TileOutput {
    item: WorkItem,
    bounds: SeqBounds,
    rows: usize,
    /// `(rows, padded_head_dim)` normalized output.
    out: Vec<f32>,
    lse: Vec<f32>,
    /// `(rows, len_k)` normalized weights, negated where dropped.
    encoded: Option<Vec<f32>>,
}

/// Raw results of a launch, laid out like the output tensors.
#[derive(Debug)]
pub struct KernelOutput<T> {
    /// `(batch, heads_q, max_seqlen_q, head_size)` or `(total_q, heads_q, head_size)`.
    pub out: Vec<T>,
    /// `(batch, heads_q, max_seqlen_q)`.
    pub softmax_lse: Vec<f32>,
    /// `(batch, heads_q, max_seqlen_q, max_seqlen_k)` when requested.
    pub encoded_softmax: Option<Vec<f32>>,
}

struct Inputs<'a, T> {
    q: Operand<'a, T>,
    k: Operand<'a, T>,
    v: Operand<'a, T>,
    bias: Option<Operand<'a, T>>,
}

impl<T: WithDType> Inputs<'_, T> {
    fn run_tile(&self, p: &Problem, item: WorkItem) -> Option<TileOutput> {
        let WorkItem {
            tile_m,
            head,
            batch,
        } = item;
        let TileConfig {
            block_m,
            block_n,
            pre_load_v,
        } = p.tiles;
        let bounds = p.seqlens.resolve(batch);
        let row_start = tile_m * block_m;
        if row_start >= bounds.len_q {
            return None;
        }
        let rows = block_m.min(bounds.len_q - row_start);
        let dp = p.padded_head_dim;

        let params = PlanParams {
            seqlen_q: bounds.len_q,
            seqlen_k: bounds.len_k,
            tile_m,
            block_m,
            block_n,
            causal: p.causal,
        };
        let plan = if p.mask_every_tile {
            TilePlan::uniform(&params)
        } else {
            TilePlan::new(&params)
        };
        let plan = match plan {
            Plan::Tiles(plan) => plan,
            Plan::Empty => {
                tracing::trace!(?item, "no reachable key, writing a zero tile");
                return Some(TileOutput {
                    item,
                    bounds,
                    rows,
                    out: vec![0.0; rows * dp],
                    lse: vec![f32::NEG_INFINITY; rows],
                    encoded: p
                        .return_encoded_softmax
                        .then(|| vec![0.0; rows * bounds.len_k]),
                });
            }
        };

        let kv_head = p.heads.kv_head(head);
        let q_shape = (bounds.len_q, p.head_size);
        let kv_shape = (bounds.len_k, p.head_size);
        let q_view = self
            .q
            .view(batch, head, bounds.start_q, q_shape, (row_start, 0), (rows, dp));
        let mut k_view = self
            .k
            .view(batch, kv_head, bounds.start_k, kv_shape, (0, 0), (block_n, dp));
        let mut v_view = self
            .v
            .view(batch, kv_head, bounds.start_k, kv_shape, (0, 0), (block_n, dp));
        let mut bias_view = self.bias.as_ref().map(|b| {
            b.view(
                batch,
                head,
                0,
                (bounds.len_q, bounds.len_k),
                (row_start, 0),
                (rows, block_n),
            )
        });

        let mut q_tile = vec![0f32; rows * dp];
        q_view.load(self.q.data, &mut q_tile);
        let qk_scale = p.softmax_scale * LOG2_E;
        q_tile.iter_mut().for_each(|x| *x *= qk_scale);

        let score_mask = ScoreMask {
            seqlen_q: bounds.len_q,
            seqlen_k: bounds.len_k,
            causal: p.causal,
        };
        let dropout = p.dropout.filter(|d| d.is_active()).map(|cfg| {
            DropoutMask::new(
                cfg,
                batch,
                head,
                p.heads.num_heads_q,
                p.max_seqlen_q,
                p.max_seqlen_k,
            )
        });

        let mut k_tile = vec![0f32; block_n * dp];
        let mut v_tile = vec![0f32; block_n * dp];
        let mut bias_tile = vec![0f32; rows * block_n];
        let mut scores = vec![0f32; rows * block_n];
        let mut encoded = p
            .return_encoded_softmax
            .then(|| EncodedRows::new(rows, bounds.len_k, block_n, plan.n_blocks));
        let mut stats = RunningStats::new(rows, dp);

        let tiles = plan
            .full_tiles()
            .map(|t| (t, false))
            .chain(plan.masked_tiles().map(|t| (t, true)));
        for (t, masked) in tiles {
            let col_start = t * block_n;
            k_view.load(self.k.data, &mut k_tile);
            if pre_load_v {
                v_view.load(self.v.data, &mut v_tile);
            }

            for i in 0..rows {
                let q_row = &q_tile[i * dp..(i + 1) * dp];
                for j in 0..block_n {
                    scores[i * block_n + j] = vec_dot(q_row, &k_tile[j * dp..(j + 1) * dp]);
                }
            }
            if let (Some(view), Some(bias)) = (bias_view.as_mut(), self.bias.as_ref()) {
                view.load(bias.data, &mut bias_tile);
                for (s, b) in scores.iter_mut().zip(&bias_tile) {
                    *s += b * LOG2_E;
                }
                *view = view.advance(0, block_n);
            }
            if masked {
                score_mask.apply(&mut scores, rows, block_n, row_start, col_start);
            }

            if !pre_load_v {
                v_view.load(self.v.data, &mut v_tile);
            }
            stats.update(&mut scores, block_n, &v_tile, |i, j| {
                dropout
                    .as_ref()
                    .is_none_or(|d| d.keep(row_start + i, col_start + j))
            });
            if let Some(encoded) = encoded.as_mut() {
                encoded.record(t, &scores, stats.max());
            }

            k_view = k_view.advance(block_n, 0);
            v_view = v_view.advance(block_n, 0);
        }

        let encoded = encoded.map(|e| e.normalize(stats.max(), stats.sum()));
        let (mut out, lse) = stats.finalize(dropout.as_ref().map_or(0.0, |d| d.p()));
        let hidden_rows = score_mask.first_visible_row().saturating_sub(row_start).min(rows);
        out[..hidden_rows * dp].fill(0.0);

        Some(TileOutput {
            item,
            bounds,
            rows,
            out,
            lse,
            encoded,
        })
    }
}

/// Pre-dropout exponentials of one query tile, rescaled once the row statistics are final.
struct EncodedRows {
    len_k: usize,
    block_n: usize,
    n_blocks: usize,
    values: Vec<f32>,
    /// Row maximum the exponentials of each `(row, key tile)` are relative to.
    tile_max: Vec<f32>,
}

impl EncodedRows {
    fn new(rows: usize, len_k: usize, block_n: usize, n_blocks: usize) -> Self {
        Self {
            len_k,
            block_n,
            n_blocks,
            values: vec![0.0; rows * len_k],
            tile_max: vec![f32::NEG_INFINITY; rows * n_blocks],
        }
    }

    fn record(&mut self, t: usize, p: &[f32], m: &[f32]) {
        let block_n = self.block_n;
        let col_start = t * block_n;
        let cols = block_n.min(self.len_k.saturating_sub(col_start));
        for (i, &m_i) in m.iter().enumerate() {
            let dst = &mut self.values[i * self.len_k + col_start..][..cols];
            dst.copy_from_slice(&p[i * block_n..i * block_n + cols]);
            self.tile_max[i * self.n_blocks + t] = m_i;
        }
    }

    fn normalize(mut self, m: &[f32], l: &[f32]) -> Vec<f32> {
        for (i, (&m_i, &l_i)) in m.iter().zip(l).enumerate() {
            let row = &mut self.values[i * self.len_k..(i + 1) * self.len_k];
            if l_i == 0.0 {
                row.fill(0.0);
                continue;
            }
            for (t, chunk) in row.chunks_mut(self.block_n).take(self.n_blocks).enumerate() {
                let factor = (self.tile_max[i * self.n_blocks + t] - m_i).exp2() / l_i;
                chunk.iter_mut().for_each(|x| *x *= factor);
            }
        }
        self.values
    }
}

/// Runs every work item of `problem` on the attention pool and assembles the results.
pub fn launch<T: WithDType>(
    problem: &Problem,
    q: Operand<'_, T>,
    k: Operand<'_, T>,
    v: Operand<'_, T>,
    bias: Option<Operand<'_, T>>,
) -> KernelOutput<T> {
    let hq = problem.heads.num_heads_q;
    let items: Vec<WorkItem> = (0..problem.batch)
        .flat_map(|batch| {
            (0..hq).flat_map(move |head| {
                (0..problem.num_m_tiles()).map(move |tile_m| WorkItem {
                    tile_m,
                    head,
                    batch,
                })
            })
        })
        .collect();
    tracing::debug!(
        work_items = items.len(),
        m_tiles = problem.num_m_tiles(),
        tiles = ?problem.tiles,
        "launching tiled attention"
    );

    let inputs = Inputs { q, k, v, bias };
    let tiles: Vec<TileOutput> = FLASH_ATTN_POOL.install(|| {
        items
            .into_par_iter()
            .filter_map(|item| inputs.run_tile(problem, item))
            .collect()
    });

    let d = problem.head_size;
    let rows_total = problem.batch * hq * problem.max_seqlen_q;
    let mut out = vec![T::from_f64(0.0); problem.total_q * hq * d];
    let mut softmax_lse = vec![f32::NEG_INFINITY; rows_total];
    let mut encoded_softmax = problem
        .return_encoded_softmax
        .then(|| vec![0f32; rows_total * problem.max_seqlen_k]);

    for tile in tiles {
        let WorkItem {
            tile_m,
            head,
            batch,
        } = tile.item;
        let row_start = tile_m * problem.tiles.block_m;
        let (base, row_stride) = problem.out_rows(batch, head, &tile.bounds);
        TileView::new(
            base,
            (tile.bounds.len_q, d),
            (row_stride, 1),
            (row_start, 0),
            (tile.rows, problem.padded_head_dim),
        )
        .store(&mut out, &tile.out);

        let first = problem.row_index(batch, head, row_start);
        softmax_lse[first..first + tile.rows].copy_from_slice(&tile.lse);

        if let (Some(dst), Some(src)) = (encoded_softmax.as_mut(), tile.encoded.as_ref()) {
            let len_k = tile.bounds.len_k;
            for i in 0..tile.rows {
                let at = (first + i) * problem.max_seqlen_k;
                dst[at..at + len_k].copy_from_slice(&src[i * len_k..(i + 1) * len_k]);
            }
        }
    }

    KernelOutput {
        out,
        softmax_lse,
        encoded_softmax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(seqlen_q: usize, seqlen_k: usize, head_size: usize, tiles: TileConfig) -> Problem {
        Problem {
            batch: 1,
            heads: HeadGroups::new(1, 1),
            head_size,
            padded_head_dim: 32,
            seqlens: SeqLens::Fixed { seqlen_q, seqlen_k },
            max_seqlen_q: seqlen_q,
            max_seqlen_k: seqlen_k,
            total_q: seqlen_q,
            causal: true,
            softmax_scale: 1.0,
            dropout: None,
            tiles,
            return_encoded_softmax: true,
            mask_every_tile: false,
        }
    }

    fn contiguous(seq: usize, d: usize) -> [usize; 4] {
        [seq * d, seq * d, d, 1]
    }

    #[test]
    fn dot_handles_remainder() {
        let a: Vec<f32> = (0..7).map(|x| x as f32).collect();
        assert_eq!(vec_dot(&a, &a), 91.0);
    }

    #[test]
    fn causal_two_by_two_tiles() {
        let q = [0f32; 8];
        let k = [0f32; 8];
        let v = [1f32, 0., 0., 1., 1., 0., 0., 1.];
        let p = problem(4, 4, 2, TileConfig::new(2, 2));
        let res = launch(
            &p,
            Operand::new(&q, contiguous(4, 2)),
            Operand::new(&k, contiguous(4, 2)),
            Operand::new(&v, contiguous(4, 2)),
            None,
        );
        let expected = [1.0, 0.0, 0.5, 0.5, 2. / 3., 1. / 3., 0.5, 0.5];
        for (o, e) in res.out.iter().zip(expected) {
            assert!((o - e).abs() < 1e-6, "{:?}", res.out);
        }
        let enc = res.encoded_softmax.unwrap();
        assert_eq!(&enc[0..4], &[1.0, 0.0, 0.0, 0.0]);
        for row in enc.chunks(4) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn rows_above_the_diagonal_are_empty() {
        let q = [1f32; 6];
        let k = [1f32; 2];
        let v = [3f32; 2];
        let p = problem(6, 2, 1, TileConfig::new(2, 2));
        let res = launch(
            &p,
            Operand::new(&q, contiguous(6, 1)),
            Operand::new(&k, contiguous(2, 1)),
            Operand::new(&v, contiguous(2, 1)),
            None,
        );
        assert_eq!(res.out, [0., 0., 0., 0., 3., 3.]);
        assert!(res.softmax_lse[..4].iter().all(|x| *x == f32::NEG_INFINITY));
        assert!((res.softmax_lse[4] - 1.0).abs() < 1e-6);
    }
}
