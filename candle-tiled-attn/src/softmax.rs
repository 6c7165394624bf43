//! Online softmax over key tiles.
//!
//! Scores arrive in base-2 units (pre-multiplied by `log2(e)`) so every exponential is an
//! `exp2`. Per query row the accumulator keeps the running maximum `m`, the running sum
//! of exponentials `l` and the un-normalized output `acc`; each key tile rescales the
//! previous state by `2^(m_old - m_new)` before adding its own contribution.

use std::f32::consts::LN_2;

#[derive(Debug, Clone)]
pub struct RunningStats {
    rows: usize,
    head_dim: usize,
    m: Vec<f32>,
    l: Vec<f32>,
    acc: Vec<f32>,
}

impl RunningStats {
    pub fn new(rows: usize, head_dim: usize) -> Self {
        Self {
            rows,
            head_dim,
            m: vec![f32::NEG_INFINITY; rows],
            l: vec![0.0; rows],
            acc: vec![0.0; rows * head_dim],
        }
    }

    /// Running maximum of each row, `-inf` until the row has seen an allowed entry.
    pub fn max(&self) -> &[f32] {
        &self.m
    }

    pub fn sum(&self) -> &[f32] {
        &self.l
    }

    /// Folds a key tile into the statistics.
    ///
    /// `scores` is a row-major `(rows, block_n)` tile of base-2 scores with disallowed
    /// entries set to `-inf`; `v` is the matching `(block_n, head_dim)` value tile. On
    /// return `scores` holds the exponentials relative to the new row maximum, negated
    /// for the entries `keep(row, col)` rejected. The row sums are taken before dropout.
    pub fn update<F>(&mut self, scores: &mut [f32], block_n: usize, v: &[f32], keep: F)
    where
        F: Fn(usize, usize) -> bool,
    {
        let d = self.head_dim;
        for i in 0..self.rows {
            let row = &mut scores[i * block_n..(i + 1) * block_n];
            let m_ij = row.iter().fold(self.m[i], |m, &s| m.max(s));
            if m_ij == f32::NEG_INFINITY {
                // Nothing reachable yet, the row state stays untouched.
                row.fill(0.0);
                continue;
            }

            let mut l_ij = 0f32;
            for s in row.iter_mut() {
                *s = (*s - m_ij).exp2();
                l_ij += *s;
            }

            let alpha = (self.m[i] - m_ij).exp2();
            let acc = &mut self.acc[i * d..(i + 1) * d];
            if alpha != 1.0 {
                acc.iter_mut().for_each(|a| *a *= alpha);
            }
            for (j, p) in row.iter_mut().enumerate() {
                if *p == 0.0 {
                    continue;
                }
                if !keep(i, j) {
                    *p = -*p;
                    continue;
                }
                let v_row = &v[j * d..(j + 1) * d];
                for (a, &vv) in acc.iter_mut().zip(v_row) {
                    *a += *p * vv;
                }
            }

            self.l[i] = self.l[i] * alpha + l_ij;
            self.m[i] = m_ij;
        }
    }

    /// Normalizes the accumulated rows and returns the output tile together with the
    /// natural-log log-sum-exp of every row.
    ///
    /// Rows that never saw an allowed entry are zero with a `-inf` log-sum-exp. With
    /// dropout the kept weights are rescaled by `1 / (1 - dropout_p)`.
    pub fn finalize(mut self, dropout_p: f32) -> (Vec<f32>, Vec<f32>) {
        let d = self.head_dim;
        let keep_scale = if dropout_p > 0.0 {
            1.0 / (1.0 - dropout_p)
        } else {
            1.0
        };
        let mut lse = vec![f32::NEG_INFINITY; self.rows];
        for i in 0..self.rows {
            let acc = &mut self.acc[i * d..(i + 1) * d];
            let l = self.l[i];
            if l == 0.0 {
                acc.fill(0.0);
                continue;
            }
            let inv = keep_scale / l;
            acc.iter_mut().for_each(|a| *a *= inv);
            lse[i] = (self.m[i] + l.log2()) * LN_2;
        }
        (self.acc, lse)
    }
}
