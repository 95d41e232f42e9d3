//! Softmax primitives
//!
//! Row softmax for the explicit path, the online-softmax recurrence used by
//! the blockwise kernel, and the log-sum-exp merge that combines partial
//! attention results computed over disjoint key sets.

/// Numerically stable in-place softmax of one row; returns the row's LSE.
///
/// A row whose entries are all -inf becomes all zeros with LSE -inf.
pub fn softmax_row(row: &mut [f32]) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        row.iter_mut().for_each(|x| *x = 0.0);
        return f32::NEG_INFINITY;
    }

    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in row.iter_mut() {
        *x /= sum;
    }
    max + sum.ln()
}

/// Running state of the online-softmax recurrence for one query row
///
/// Keys arrive in blocks; after each block the accumulator holds
/// `sum_j exp(s_j - max) * v_j` over every key seen so far.
#[derive(Debug, Clone)]
pub struct OnlineSoftmax {
    max: f32,
    sum: f32,
    acc: Vec<f32>,
}

impl OnlineSoftmax {
    pub fn new(head_dim: usize) -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
            acc: vec![0.0; head_dim],
        }
    }

    /// Fold in one block of scores with their value rows (`values` is `scores.len() x head_dim`)
    pub fn update(&mut self, scores: &[f32], values: &[f32]) {
        let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if block_max == f32::NEG_INFINITY {
            return;
        }

        let new_max = self.max.max(block_max);
        let correction = if self.max == f32::NEG_INFINITY {
            0.0
        } else {
            (self.max - new_max).exp()
        };

        self.sum *= correction;
        for a in self.acc.iter_mut() {
            *a *= correction;
        }

        let d = self.acc.len();
        for (j, &s) in scores.iter().enumerate() {
            let p = (s - new_max).exp();
            self.sum += p;
            let v = &values[j * d..(j + 1) * d];
            for (a, &vv) in self.acc.iter_mut().zip(v) {
                *a += p * vv;
            }
        }
        self.max = new_max;
    }

    /// Write the normalized output row and return the LSE
    pub fn finish(&self, out: &mut [f32]) -> f32 {
        if self.sum == 0.0 {
            out.iter_mut().for_each(|x| *x = 0.0);
            return f32::NEG_INFINITY;
        }
        let inv = 1.0 / self.sum;
        for (o, &a) in out.iter_mut().zip(&self.acc) {
            *o = a * inv;
        }
        self.max + self.sum.ln()
    }
}

/// `log(exp(a) + exp(b))` without overflow; -inf on either side yields the other
pub fn log_add_exp(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Merge a partial result into an accumulated one, row by row.
///
/// `out`/`part_out` are `rows x head_dim`, `lse`/`part_lse` are `rows`.
/// Rows where the partial LSE is -inf leave the accumulator untouched; rows
/// where the accumulator is still -inf take the partial verbatim.
pub fn merge_partial(
    out: &mut [f32],
    lse: &mut [f32],
    part_out: &[f32],
    part_lse: &[f32],
    head_dim: usize,
) {
    for (row, (l, &pl)) in lse.iter_mut().zip(part_lse).enumerate() {
        let o = &mut out[row * head_dim..(row + 1) * head_dim];
        let po = &part_out[row * head_dim..(row + 1) * head_dim];

        if pl == f32::NEG_INFINITY {
            continue;
        }
        if *l == f32::NEG_INFINITY {
            o.copy_from_slice(po);
            *l = pl;
            continue;
        }

        let new_lse = log_add_exp(*l, pl);
        let wa = (*l - new_lse).exp();
        let wb = (pl - new_lse).exp();
        for (a, &b) in o.iter_mut().zip(po) {
            *a = *a * wa + b * wb;
        }
        *l = new_lse;
    }
}
