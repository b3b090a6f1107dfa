//! Pooling, MRL truncation and L2 normalization

use ndarray::{s, Array2, ArrayView3, Axis};

use crate::models::PoolingStrategy;

/// Reduce `[batch, seq_len, hidden]` hidden states to `[batch, hidden]`.
///
/// `lengths[i]` is the number of real (non-padding) tokens of row `i`; rows are
/// right-padded, so the real tokens are always `0..lengths[i]`. Every length
/// must be at least 1.
pub fn pool(hidden: ArrayView3<f32>, lengths: &[usize], strategy: PoolingStrategy) -> Array2<f32> {
    let (rows, _, hidden_size) = hidden.dim();
    let mut pooled = Array2::zeros((rows, hidden_size));

    for (row, &len) in lengths.iter().enumerate().take(rows) {
        let len = len.max(1);
        let vector = match strategy {
            // The padded tail is not the last token; index by the real length.
            PoolingStrategy::LastToken => hidden.slice(s![row, len - 1, ..]).to_owned(),
            PoolingStrategy::MeanPooling => hidden
                .slice(s![row, ..len, ..])
                .mean_axis(Axis(0))
                .unwrap_or_else(|| ndarray::Array1::zeros(hidden_size)),
        };
        pooled.row_mut(row).assign(&vector);
    }

    pooled
}

/// L2-normalize in place. Returns `false` for a zero vector, which is left untouched.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}

/// Keep the first `dim` components and renormalize.
///
/// With `dim` equal to the vector length this is plain L2 normalization.
pub fn truncate_and_normalize(mut vector: Vec<f32>, dim: usize) -> Option<Vec<f32>> {
    vector.truncate(dim);
    l2_normalize(&mut vector).then_some(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Two rows, seq_len 3, hidden 2. Row 1 has a single real token followed
    /// by padding filled with large values.
    fn hidden() -> Array3<f32> {
        let mut h = Array3::zeros((2, 3, 2));
        h[[0, 0, 0]] = 1.0;
        h[[0, 1, 0]] = 3.0;
        h[[0, 2, 1]] = 6.0;
        h[[1, 0, 0]] = 2.0;
        h[[1, 0, 1]] = 4.0;
        h[[1, 1, 0]] = 100.0;
        h[[1, 2, 1]] = 100.0;
        h
    }

    #[test]
    fn test_last_token_uses_real_length() {
        let pooled = pool(hidden().view(), &[3, 1], PoolingStrategy::LastToken);
        assert_eq!(pooled.row(0).to_vec(), vec![0.0, 6.0]);
        assert_eq!(pooled.row(1).to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_pooling_ignores_padding() {
        let pooled = pool(hidden().view(), &[3, 1], PoolingStrategy::MeanPooling);
        assert_eq!(pooled.row(0).to_vec(), vec![4.0 / 3.0, 2.0]);
        assert_eq!(pooled.row(1).to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert_eq!(v, vec![0.6, 0.8]);

        let mut zero = vec![0.0, 0.0];
        assert!(!l2_normalize(&mut zero));
    }

    #[test]
    fn test_truncate_and_normalize() {
        let v = truncate_and_normalize(vec![3.0, 4.0, 12.0], 2).unwrap();
        assert_eq!(v, vec![0.6, 0.8]);
        assert!(truncate_and_normalize(vec![0.0, 0.0, 1.0], 2).is_none());
    }
}
