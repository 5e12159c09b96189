// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Vector similarity primitives.
//!
//! Scoring is brute-force cosine over dense f32 rows; the stores this crate
//! serves hold thousands of vectors per partition, where a scan beats an
//! ANN structure on both latency and code weight.

pub mod matrix;

pub use matrix::{MatrixError, VectorMatrix};

/// Cosine similarity of two equal-length vectors, clamped to [0, 1] to
/// absorb float drift. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// A scored row from a matrix scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub row: usize,
    pub score: f32,
}

/// Score every row of `matrix` against `query` and return the `top_k`
/// highest, descending. Ties keep the lower row index first (stable for
/// the caller's own tie-breaking).
pub fn top_k_cosine(matrix: &VectorMatrix, query: &[f32], top_k: usize) -> Vec<Scored> {
    let mut scored: Vec<Scored> = (0..matrix.rows())
        .map(|row| Scored {
            row,
            score: cosine_similarity(matrix.row(row), query),
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.row.cmp(&b.row))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_is_one() {
        let v = vec![0.3, -0.2, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_top_k_orders_and_truncates() {
        let mut m = VectorMatrix::new(2);
        m.push(&[1.0, 0.0]).unwrap();
        m.push(&[0.0, 1.0]).unwrap();
        m.push(&[0.7, 0.7]).unwrap();

        let hits = top_k_cosine(&m, &[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].row, 0);
        assert_eq!(hits[1].row, 2);
        assert!(hits[0].score > hits[1].score);
    }
}
