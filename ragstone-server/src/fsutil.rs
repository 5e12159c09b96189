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

//! Small filesystem helpers shared by the storage layers. Every JSON
//! write goes through a temp file and rename so a crash mid-write never
//! leaves a torn file behind.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use ragstone_core::ServiceError;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ServiceError> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| ServiceError::Internal(format!("serialize {path:?}: {e}")))?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ServiceError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ServiceError::StorageFailure(format!("corrupt JSON in {path:?}: {e}")))
}

/// Bytes used by a directory tree.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Recursive directory copy, used by KB backup/restore.
pub fn copy_dir_recursive(from: &Path, to: &Path) -> Result<(), ServiceError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let dest = to.join(entry.file_name());
        if source.is_dir() {
            copy_dir_recursive(&source, &dest)?;
        } else {
            std::fs::copy(&source, &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        let values: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_json_is_storage_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{broken").unwrap();
        let err = read_json::<Vec<i32>>(&path).unwrap_err();
        assert!(matches!(err, ServiceError::StorageFailure(_)));
    }

    #[test]
    fn test_copy_dir_recursive() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/file.txt"), "payload").unwrap();

        let dst = TempDir::new().unwrap();
        let target = dst.path().join("copy");
        copy_dir_recursive(src.path(), &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("nested/file.txt")).unwrap(),
            "payload"
        );
    }
}
