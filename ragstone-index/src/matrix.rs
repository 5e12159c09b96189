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

//! Dense row-major f32 matrix with a small binary file format.
//!
//! File layout (`vectors.bin`): `RGVC` magic, row count (u32 LE),
//! dimension (u32 LE), then rows * dim little-endian f32 values. Writes go
//! through a temp file and rename, so readers never observe a torn file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

const MAGIC: &[u8; 4] = b"RGVC";

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("row {row} out of bounds (rows: {rows})")]
    RowOutOfBounds { row: usize, rows: usize },

    #[error("corrupt vector file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Row-major matrix of embedding vectors. Row order is the caller's
/// contract; the QA store keeps row i aligned with its pair list.
#[derive(Debug, Clone)]
pub struct VectorMatrix {
    dim: usize,
    data: Vec<f32>,
}

impl VectorMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    /// Append one vector as the last row.
    pub fn push(&mut self, vector: &[f32]) -> Result<usize, MatrixError> {
        if vector.len() != self.dim {
            return Err(MatrixError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(self.rows() - 1)
    }

    /// Remove a row by swapping the last row into its slot, then
    /// truncating. Returns the index of the row that moved into `row`
    /// (None when `row` was the last). The caller updates its reverse
    /// index accordingly.
    pub fn swap_remove(&mut self, row: usize) -> Result<Option<usize>, MatrixError> {
        let rows = self.rows();
        if row >= rows {
            return Err(MatrixError::RowOutOfBounds { row, rows });
        }
        let last = rows - 1;
        if row != last {
            let (head, tail) = self.data.split_at_mut(last * self.dim);
            head[row * self.dim..(row + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
        }
        self.data.truncate(last * self.dim);
        Ok(if row != last { Some(last) } else { None })
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Approximate resident size, for cache/stats accounting.
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Write the matrix to `path` atomically (temp file + rename).
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), MatrixError> {
        let path = path.as_ref();
        let tmp = path.with_extension("bin.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            w.write_all(MAGIC)?;
            w.write_all(&(self.rows() as u32).to_le_bytes())?;
            w.write_all(&(self.dim as u32).to_le_bytes())?;
            for value in &self.data {
                w.write_all(&value.to_le_bytes())?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a matrix, verifying magic, header and payload length.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MatrixError> {
        let mut r = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(MatrixError::Corrupt("bad magic".into()));
        }

        let mut header = [0u8; 4];
        r.read_exact(&mut header)?;
        let rows = u32::from_le_bytes(header) as usize;
        r.read_exact(&mut header)?;
        let dim = u32::from_le_bytes(header) as usize;

        let mut payload = Vec::new();
        r.read_to_end(&mut payload)?;
        let expected = rows * dim * std::mem::size_of::<f32>();
        if payload.len() != expected {
            return Err(MatrixError::Corrupt(format!(
                "payload is {} bytes, header promises {}",
                payload.len(),
                expected
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { dim, data })
    }
}
