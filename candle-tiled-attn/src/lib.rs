//! Tiled flash attention for candle CPU tensors.
//!
//! Computes `softmax(scale * q @ k^T + bias) @ v` one `(query tile, key tile)` block at a
//! time with an online softmax, so the full attention matrix is never materialized.
//! Supports causal masking, packed variable-length batches, grouped-query attention,
//! dropout driven by a counter-based generator and arbitrary head sizes up to 256.
//!
//! ```no_run
//! # fn main() -> candle::Result<()> {
//! use candle::{Device, Tensor};
//! let q = Tensor::randn(0f32, 1., (1, 8, 128, 64), &Device::Cpu)?;
//! let k = Tensor::randn(0f32, 1., (1, 2, 128, 64), &Device::Cpu)?;
//! let v = Tensor::randn(0f32, 1., (1, 2, 128, 64), &Device::Cpu)?;
//! let out = candle_tiled_attn::flash_attn(&q, &k, &v, 0.125, true)?;
//! assert_eq!(out.dims(), &[1, 8, 128, 64]);
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod heads;
pub mod kernel;
pub mod mask;
pub mod philox;
pub mod plan;
pub mod seqlens;
pub mod softmax;
pub mod tile;

use std::sync::{Arc, LazyLock};

use candle::{DType, Device, Layout, Result, Storage, Tensor, WithDType};
use half::{bf16, f16};

pub use config::{
    padded_head_dim, CachedTilePolicy, DefaultTilePolicy, TileConfig, TilePolicy, TuningKey,
};
pub use heads::HeadGroups;
pub use kernel::{KernelOutput, Operand, Problem};
pub use mask::DropoutConfig;
pub use seqlens::{SeqBounds, SeqLens};

static DEFAULT_TILE_POLICY: LazyLock<CachedTilePolicy<DefaultTilePolicy>> =
    LazyLock::new(|| CachedTilePolicy::new(DefaultTilePolicy::default()));

/// Results of a forward call.
#[derive(Debug, Clone)]
pub struct AttnOutput {
    /// Same shape and dtype as the queries.
    pub out: Tensor,
    /// `(batch, heads_q, max_seqlen_q, max_seqlen_k)` f32 softmax weights before dropout,
    /// negated where dropout removed the entry.
    pub encoded_softmax: Option<Tensor>,
    /// `(batch, heads_q, max_seqlen_q)` f32 natural-log log-sum-exp of the scaled scores.
    pub softmax_lse: Option<Tensor>,
}

/// Attention parameters shared by the fixed and packed entry points.
#[derive(Clone)]
pub struct FlashAttn {
    pub softmax_scale: f32,
    pub causal: bool,
    pub dropout: Option<DropoutConfig>,
    /// Tile selection, the process-wide default table when `None`.
    pub tile_policy: Option<Arc<dyn TilePolicy>>,
    pub return_encoded_softmax: bool,
    pub return_softmax_lse: bool,
    /// Run the boundary and causal masks on every visited key tile instead of only on the
    /// trailing ones. The output is identical.
    pub mask_every_tile: bool,
}

impl std::fmt::Debug for FlashAttn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashAttn")
            .field("softmax_scale", &self.softmax_scale)
            .field("causal", &self.causal)
            .field("dropout", &self.dropout)
            .field("return_encoded_softmax", &self.return_encoded_softmax)
            .field("return_softmax_lse", &self.return_softmax_lse)
            .field("mask_every_tile", &self.mask_every_tile)
            .finish_non_exhaustive()
    }
}

impl FlashAttn {
    pub fn new(softmax_scale: f32, causal: bool) -> Self {
        Self {
            softmax_scale,
            causal,
            dropout: None,
            tile_policy: None,
            return_encoded_softmax: false,
            return_softmax_lse: false,
            mask_every_tile: false,
        }
    }

    pub fn with_dropout(mut self, dropout: DropoutConfig) -> Self {
        self.dropout = Some(dropout);
        self
    }

    /// Uses `tiles` for every problem.
    pub fn with_tiles(self, tiles: TileConfig) -> Self {
        self.with_tile_policy(Arc::new(tiles))
    }

    pub fn with_tile_policy(mut self, policy: Arc<dyn TilePolicy>) -> Self {
        self.tile_policy = Some(policy);
        self
    }

    /// Attention over `(batch, heads, seq, head_size)` tensors.
    ///
    /// `k` and `v` are `(batch, heads_k, seqlen_k, head_size)` with `heads_k` dividing the
    /// number of query heads. The optional bias is `(batch|1, heads_q|1, >=seqlen_q,
    /// >=seqlen_k)`.
    pub fn fwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<AttnOutput> {
        self.forward(q, k, v, None, None, None, 0, 0, bias)
    }

    /// Attention over packed `(total_tokens, heads, head_size)` tensors.
    ///
    /// Sequence `i` occupies tokens `cu_seqlens_q[i]..cu_seqlens_q[i + 1]` of `q` and
    /// `cu_seqlens_k[i]..cu_seqlens_k[i + 1]` of `k` and `v`; no sequence may be longer
    /// than the matching `max_seqlen`. Bias rows and columns are positions inside each
    /// sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn fwd_varlen(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cu_seqlens_q: &Tensor,
        cu_seqlens_k: &Tensor,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        bias: Option<&Tensor>,
    ) -> Result<AttnOutput> {
        self.forward(
            q,
            k,
            v,
            None,
            Some(cu_seqlens_q),
            Some(cu_seqlens_k),
            max_seqlen_q,
            max_seqlen_k,
            bias,
        )
    }

    /// Shared entry point: packed when the cumulative tables are given, fixed otherwise.
    /// When `o` is given the result is written into it and it is returned as `out`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        o: Option<&Tensor>,
        cu_seqlens_q: Option<&Tensor>,
        cu_seqlens_k: Option<&Tensor>,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        bias: Option<&Tensor>,
    ) -> Result<AttnOutput> {
        let packed = match (cu_seqlens_q, cu_seqlens_k) {
            (Some(cu_q), Some(cu_k)) => Some((cu_q, cu_k)),
            (None, None) => None,
            _ => candle::bail!("cu_seqlens_q and cu_seqlens_k must be given together"),
        };
        let dims = check_qkv(q, k, v, packed.is_some())?;

        let (batch, seqlens, max_seqlen_q, max_seqlen_k) = match packed {
            None => (
                dims.batch,
                SeqLens::Fixed {
                    seqlen_q: dims.tokens_q,
                    seqlen_k: dims.tokens_k,
                },
                dims.tokens_q,
                dims.tokens_k,
            ),
            Some((cu_q, cu_k)) => {
                let cu_seqlens_q = cu_table(cu_q, "cu_seqlens_q", dims.tokens_q, max_seqlen_q)?;
                let cu_seqlens_k = cu_table(cu_k, "cu_seqlens_k", dims.tokens_k, max_seqlen_k)?;
                if cu_seqlens_q.len() != cu_seqlens_k.len() {
                    candle::bail!(
                        "cu_seqlens_q and cu_seqlens_k differ in length ({} vs {})",
                        cu_seqlens_q.len(),
                        cu_seqlens_k.len()
                    )
                }
                let batch = cu_seqlens_q.len() - 1;
                let seqlens = SeqLens::Packed {
                    cu_seqlens_q,
                    cu_seqlens_k,
                };
                (batch, seqlens, max_seqlen_q, max_seqlen_k)
            }
        };

        if let Some(o) = o {
            if o.shape() != q.shape() {
                candle::bail!("shape mismatch q {:?} and o {:?}", q.shape(), o.shape())
            }
            if o.dtype() != q.dtype() {
                candle::bail!("dtype mismatch q {:?} and o {:?}", q.dtype(), o.dtype())
            }
            if !o.is_contiguous() {
                candle::bail!("o must be contiguous")
            }
        }
        let bias_strides = match bias {
            Some(bias) => Some(check_bias(
                bias,
                q.dtype(),
                batch,
                &dims,
                max_seqlen_q,
                max_seqlen_k,
            )?),
            None => None,
        };
        let dropout = match self.dropout {
            Some(d) if !(0.0..1.0).contains(&d.p) => {
                candle::bail!("dropout probability must be in [0, 1), got {}", d.p)
            }
            Some(d) if d.is_active() => Some(d),
            _ => None,
        };

        let Some(padded_head_dim) = padded_head_dim(dims.head_size) else {
            candle::bail!(
                "only supports head dimension at most 256 (got {})",
                dims.head_size
            )
        };
        let key = TuningKey {
            causal: self.causal,
            dropout_p: dropout.map_or(0.0, |d| d.p),
            padded_head_dim,
        };
        let tiles = match &self.tile_policy {
            Some(policy) => policy.select(&key),
            None => DEFAULT_TILE_POLICY.select(&key),
        };
        tiles.validate()?;

        let _span = tracing::debug_span!(
            "tiled_attn",
            batch,
            heads_q = dims.heads.num_heads_q,
            heads_k = dims.heads.num_heads_k,
            max_seqlen_q,
            max_seqlen_k,
            head_size = dims.head_size,
            causal = self.causal,
            packed = seqlens.is_packed(),
        )
        .entered();

        let problem = Problem {
            batch,
            heads: dims.heads,
            head_size: dims.head_size,
            padded_head_dim,
            seqlens,
            max_seqlen_q,
            max_seqlen_k,
            total_q: if packed.is_some() {
                dims.tokens_q
            } else {
                dims.batch * dims.tokens_q
            },
            causal: self.causal,
            softmax_scale: self.softmax_scale,
            dropout,
            tiles,
            return_encoded_softmax: self.return_encoded_softmax,
            mask_every_tile: self.mask_every_tile,
        };

        let bias = bias.zip(bias_strides);
        let (out, softmax_lse, encoded_softmax) = match q.dtype() {
            DType::F32 => run::<f32>(&problem, q, k, v, bias)?,
            DType::F64 => run::<f64>(&problem, q, k, v, bias)?,
            DType::F16 => run::<f16>(&problem, q, k, v, bias)?,
            DType::BF16 => run::<bf16>(&problem, q, k, v, bias)?,
            dt => candle::bail!("tiled attention does not support dtype {dt:?}"),
        };

        let rows = (batch, dims.heads.num_heads_q, max_seqlen_q);
        let softmax_lse = if self.return_softmax_lse {
            Some(Tensor::from_vec(softmax_lse, rows, &Device::Cpu)?)
        } else {
            None
        };
        let encoded_softmax = match encoded_softmax {
            Some(e) => Some(Tensor::from_vec(
                e,
                (rows.0, rows.1, rows.2, max_seqlen_k),
                &Device::Cpu,
            )?),
            None => None,
        };
        let out = match o {
            Some(o) => {
                o.slice_set(&out, 0, 0)?;
                o.clone()
            }
            None => out,
        };
        Ok(AttnOutput {
            out,
            encoded_softmax,
            softmax_lse,
        })
    }
}

/// Validated dimensions of the attention operands.
#[derive(Debug, Clone, Copy)]
struct QkvDims {
    /// Batch size in fixed layout, 1 for packed tensors.
    batch: usize,
    /// Sequence length (fixed) or total number of tokens (packed).
    tokens_q: usize,
    tokens_k: usize,
    heads: HeadGroups,
    head_size: usize,
}

fn check_qkv(q: &Tensor, k: &Tensor, v: &Tensor, packed: bool) -> Result<QkvDims> {
    let rank = if packed { 3 } else { 4 };
    let (q_rank, k_rank, v_rank) = (q.rank(), k.rank(), v.rank());
    if q_rank != rank || k_rank != rank || v_rank != rank {
        candle::bail!(
            "tiled attention expects input tensors of rank {rank} (q: {q_rank}, k: {k_rank}, v: {v_rank})"
        )
    }
    if q.dtype() != k.dtype() || q.dtype() != v.dtype() {
        candle::bail!(
            "dtype mismatch q {:?}, k {:?}, v {:?}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )
    }
    if k.shape() != v.shape() {
        candle::bail!("shape mismatch k {:?} and v {:?}", k.shape(), v.shape())
    }
    if !q.device().is_cpu() || !k.device().is_cpu() || !v.device().is_cpu() {
        candle::bail!("tiled attention only runs on the cpu device")
    }

    let ((batch, tokens_q, num_heads_q, head_size), (tokens_k, num_heads_k, head_size_k)) =
        if packed {
            let (tokens_q, num_heads_q, head_size) = q.dims3()?;
            ((1, tokens_q, num_heads_q, head_size), k.dims3()?)
        } else {
            let (batch, num_heads_q, seqlen_q, head_size) = q.dims4()?;
            let (batch_k, num_heads_k, seqlen_k, head_size_k) = k.dims4()?;
            if batch != batch_k {
                candle::bail!("shape mismatch q {:?} and k {:?}", q.shape(), k.shape())
            }
            (
                (batch, seqlen_q, num_heads_q, head_size),
                (seqlen_k, num_heads_k, head_size_k),
            )
        };
    if head_size != head_size_k {
        candle::bail!("head size mismatch q {head_size} and k {head_size_k}")
    }
    if head_size == 0 || head_size > 256 {
        candle::bail!("only supports head dimension in 1..=256 (got {head_size})")
    }
    if num_heads_k == 0 || num_heads_q % num_heads_k != 0 {
        candle::bail!(
            "number of k/v heads {num_heads_k} must divide number of heads in query {num_heads_q}"
        )
    }
    Ok(QkvDims {
        batch,
        tokens_q,
        tokens_k,
        heads: HeadGroups::new(num_heads_q, num_heads_k),
        head_size,
    })
}

fn cu_table(
    cu: &Tensor,
    name: &str,
    total_tokens: usize,
    max_seqlen: usize,
) -> Result<Vec<u32>> {
    if cu.rank() != 1 {
        candle::bail!("{name} must be a vector, got shape {:?}", cu.shape())
    }
    let table = cu.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    if table.is_empty() {
        candle::bail!("{name} must hold at least one entry")
    }
    for w in table.windows(2) {
        if w[1] < w[0] {
            candle::bail!("{name} must be non-decreasing, got {table:?}")
        }
        let len = (w[1] - w[0]) as usize;
        if len > max_seqlen {
            candle::bail!("{name} holds a sequence of length {len} above the maximum {max_seqlen}")
        }
    }
    if let Some(&last) = table.last() {
        if last as usize > total_tokens {
            candle::bail!("{name} ends at {last} past the {total_tokens} packed tokens")
        }
    }
    Ok(table)
}

fn check_bias(
    bias: &Tensor,
    dtype: DType,
    batch: usize,
    dims: &QkvDims,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
) -> Result<[usize; 4]> {
    if bias.dtype() != dtype {
        candle::bail!("dtype mismatch q {dtype:?} and bias {:?}", bias.dtype())
    }
    let (b_bias, h_bias, q_bias, k_bias) = bias.dims4()?;
    let heads_q = dims.heads.num_heads_q;
    if (b_bias != 1 && b_bias != batch)
        || (h_bias != 1 && h_bias != heads_q)
        || q_bias < max_seqlen_q
        || k_bias < max_seqlen_k
    {
        candle::bail!(
            "bias of shape {:?} does not cover (batch {batch}, heads {heads_q}, {max_seqlen_q}, {max_seqlen_k})",
            bias.shape()
        )
    }
    let stride = bias.stride();
    Ok([
        if b_bias == 1 { 0 } else { stride[0] },
        if h_bias == 1 { 0 } else { stride[1] },
        stride[2],
        stride[3],
    ])
}

fn cpu_slice<'a, T: WithDType>(
    storage: &'a Storage,
    layout: &Layout,
    name: &str,
) -> Result<&'a [T]> {
    match storage {
        Storage::Cpu(cpu) => Ok(&cpu.as_slice::<T>()?[layout.start_offset()..]),
        _ => candle::bail!("expected cpu storage for {name}"),
    }
}

/// Strides along `(batch, head, token, dim)`, packed tensors lack the batch axis.
fn operand_strides(layout: &Layout, packed: bool) -> [usize; 4] {
    let s = layout.stride();
    if packed {
        [0, s[1], s[0], s[2]]
    } else {
        [s[0], s[1], s[2], s[3]]
    }
}

type RunOutput = (Tensor, Vec<f32>, Option<Vec<f32>>);

fn run<T: WithDType>(
    problem: &Problem,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<(&Tensor, [usize; 4])>,
) -> Result<RunOutput> {
    let packed = problem.seqlens.is_packed();
    let (q_guard, q_layout) = q.storage_and_layout();
    let (k_guard, k_layout) = k.storage_and_layout();
    let (v_guard, v_layout) = v.storage_and_layout();
    let q_op = Operand::new(
        cpu_slice::<T>(&q_guard, q_layout, "q")?,
        operand_strides(q_layout, packed),
    );
    let k_op = Operand::new(
        cpu_slice::<T>(&k_guard, k_layout, "k")?,
        operand_strides(k_layout, packed),
    );
    let v_op = Operand::new(
        cpu_slice::<T>(&v_guard, v_layout, "v")?,
        operand_strides(v_layout, packed),
    );

    let bias_guard = bias.map(|(b, strides)| (b.storage_and_layout(), strides));
    let bias_op = match &bias_guard {
        Some(((guard, layout), strides)) => {
            Some(Operand::new(cpu_slice::<T>(guard, layout, "bias")?, *strides))
        }
        None => None,
    };

    let KernelOutput {
        out,
        softmax_lse,
        encoded_softmax,
    } = kernel::launch(problem, q_op, k_op, v_op, bias_op);
    let out = Tensor::from_vec(out, q.shape(), &Device::Cpu)?;
    Ok((out, softmax_lse, encoded_softmax))
}

/// Attention over `(batch, heads, seq, head_size)` tensors.
pub fn flash_attn(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    Ok(FlashAttn::new(softmax_scale, causal).fwd(q, k, v, None)?.out)
}

/// Attention over packed `(total_tokens, heads, head_size)` tensors, see
/// [`FlashAttn::fwd_varlen`].
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens_q: &Tensor,
    cu_seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    let out = FlashAttn::new(softmax_scale, causal).fwd_varlen(
        q,
        k,
        v,
        cu_seqlens_q,
        cu_seqlens_k,
        max_seqlen_q,
        max_seqlen_k,
        None,
    )?;
    Ok(out.out)
}

/// Attention with an optional output tensor and cumulative tables.
///
/// Returns the output and the encoded softmax. The latter is only produced by a
/// [`FlashAttn`] with `return_encoded_softmax` set, so it is `None` here.
#[allow(clippy::too_many_arguments)]
pub fn forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    o: Option<&Tensor>,
    cu_seqlens_q: Option<&Tensor>,
    cu_seqlens_k: Option<&Tensor>,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    causal: bool,
    softmax_scale: f32,
    bias: Option<&Tensor>,
) -> Result<(Tensor, Option<Tensor>)> {
    let res = FlashAttn::new(softmax_scale, causal).forward(
        q,
        k,
        v,
        o,
        cu_seqlens_q,
        cu_seqlens_k,
        max_seqlen_q,
        max_seqlen_k,
        bias,
    )?;
    Ok((res.out, res.encoded_softmax))
}
