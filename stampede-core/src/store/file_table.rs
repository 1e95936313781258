use std::collections::HashMap;

use stampede_proto::{Sequence, WriteId};

/// One stored version of a file.
#[derive(Clone, Debug)]
pub struct FileVersion {
    /// On-disk name, `[filename][seq-time][seq-count]`.
    pub concat_name: String,
    pub seq: Sequence,
    pub write_id: WriteId,
}

/// Per-file ordered version lists.
///
/// Versions are kept sorted ascending by sequence at insertion time, so
/// the read path never mutates structure. Per filename no two versions
/// share a sequence or a write id; inserts violating that are no-ops.
#[derive(Debug, Default)]
pub struct FileTable {
    files: HashMap<String, Vec<FileVersion>>,
}

impl FileTable {
    /// Idempotent insert. Returns `false` (without inserting) when the
    /// write id or the sequence already exists for this filename.
    pub fn insert(&mut self, filename: &str, version: FileVersion) -> bool {
        let versions = self.files.entry(filename.to_string()).or_default();

        let duplicate = versions
            .iter()
            .any(|v| v.write_id == version.write_id || v.seq == version.seq);
        if duplicate {
            return false;
        }

        let at = versions.partition_point(|v| v.seq < version.seq);
        versions.insert(at, version);
        true
    }

    /// `version` = 1 returns the latest, k the k-th newest.
    pub fn get(&self, filename: &str, version: usize) -> Option<&FileVersion> {
        let versions = self.files.get(filename)?;
        if version == 0 || versions.len() < version {
            return None;
        }
        Some(&versions[versions.len() - version])
    }

    pub fn latest(&self, filename: &str) -> Option<&FileVersion> {
        self.get(filename, 1)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    /// Remove the filename wholesale. Returns its versions so the caller
    /// can recycle the on-disk copies.
    pub fn delete(&mut self, filename: &str) -> Vec<FileVersion> {
        self.files.remove(filename).unwrap_or_default()
    }

    pub fn versions(&self, filename: &str) -> &[FileVersion] {
        self.files
            .get(filename)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn num_versions(&self, filename: &str) -> usize {
        self.versions(filename).len()
    }

    pub fn stored_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
