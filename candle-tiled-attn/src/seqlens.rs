//! Per-batch sequence bounds for fixed and packed layouts.

/// Lengths and start offsets of one batch element's query and key sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqBounds {
    pub len_q: usize,
    pub len_k: usize,
    /// First token of the query sequence along the token axis (0 in fixed mode).
    pub start_q: usize,
    /// First token of the key/value sequence along the token axis (0 in fixed mode).
    pub start_k: usize,
}

/// Where the sequence lengths of a batch come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqLens {
    /// Every batch element has the same lengths; tensors are `(batch, head, seq, dim)`.
    Fixed { seqlen_q: usize, seqlen_k: usize },
    /// Sequences are concatenated along the token axis of `(total, head, dim)` tensors.
    /// `cu_seqlens_*[i]..cu_seqlens_*[i + 1]` is the token range of batch element `i`.
    Packed {
        cu_seqlens_q: Vec<u32>,
        cu_seqlens_k: Vec<u32>,
    },
}

impl SeqLens {
    pub fn is_packed(&self) -> bool {
        matches!(self, Self::Packed { .. })
    }

    /// Resolves the bounds of batch element `batch`.
    ///
    /// The cumulative tables are expected to be well formed (validated by the caller).
    pub fn resolve(&self, batch: usize) -> SeqBounds {
        match self {
            Self::Fixed { seqlen_q, seqlen_k } => SeqBounds {
                len_q: *seqlen_q,
                len_k: *seqlen_k,
                start_q: 0,
                start_k: 0,
            },
            Self::Packed {
                cu_seqlens_q,
                cu_seqlens_k,
            } => {
                let start_q = cu_seqlens_q[batch] as usize;
                let start_k = cu_seqlens_k[batch] as usize;
                SeqBounds {
                    len_q: cu_seqlens_q[batch + 1] as usize - start_q,
                    len_k: cu_seqlens_k[batch + 1] as usize - start_k,
                    start_q,
                    start_k,
                }
            }
        }
    }
}
