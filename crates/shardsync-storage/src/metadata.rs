//! Segment file metadata and replication checkpoints
//!
//! A checkpoint names the exact set of segment files a primary held at one
//! commit. Replicas diff a checkpoint's file set against their own to find
//! what has to be transferred.

use serde::{Deserialize, Serialize};
use shardsync_common::{Checksum, Error, Result, ShardId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Metadata for one immutable segment file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    name: String,
    length: u64,
    checksum: Checksum,
    /// Opaque writer metadata carried along with the file, never interpreted
    #[serde(default)]
    user_data: BTreeMap<String, String>,
}

impl StoreFileMetadata {
    pub fn new(name: impl Into<String>, length: u64, checksum: Checksum) -> Self {
        Self {
            name: name.into(),
            length,
            checksum,
            user_data: BTreeMap::new(),
        }
    }

    /// Describe a file from its full contents
    pub fn for_contents(name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(name, data.len() as u64, Checksum::compute(data))
    }

    #[must_use]
    pub fn with_user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    /// Two files with equal name, length and checksum are the same file and
    /// never need re-transfer. Writer metadata does not take part.
    pub fn is_same(&self, other: &Self) -> bool {
        self.name == other.name && self.length == other.length && self.checksum == other.checksum
    }
}

impl fmt::Display for StoreFileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(len={}, checksum={})",
            self.name, self.length, self.checksum
        )
    }
}

/// Segment files of a shard keyed by name
pub type MetadataSnapshot = BTreeMap<String, StoreFileMetadata>;

/// Segment file names become file names in the shard directory
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::invalid_argument(format!(
            "invalid segment file name length: {:?}",
            name
        )));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(Error::invalid_argument(format!(
            "invalid segment file name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Immutable snapshot of a primary shard's segment set at one commit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    shard_id: ShardId,
    primary_term: u64,
    segments_gen: u64,
    files: MetadataSnapshot,
    size: u64,
}

impl ReplicationCheckpoint {
    /// Create a checkpoint. A later entry wins if two share a name.
    pub fn new(
        shard_id: ShardId,
        primary_term: u64,
        segments_gen: u64,
        files: impl IntoIterator<Item = StoreFileMetadata>,
    ) -> Self {
        let files: MetadataSnapshot = files
            .into_iter()
            .map(|meta| (meta.name.clone(), meta))
            .collect();
        let size = files.values().map(StoreFileMetadata::length).sum();
        Self {
            shard_id,
            primary_term,
            segments_gen,
            files,
            size,
        }
    }

    /// The checkpoint of a shard that has never committed
    pub fn empty(shard_id: ShardId) -> Self {
        Self::new(shard_id, 0, 0, [])
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn primary_term(&self) -> u64 {
        self.primary_term
    }

    pub fn segments_gen(&self) -> u64 {
        self.segments_gen
    }

    /// Total bytes across all files
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn files(&self) -> &MetadataSnapshot {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.files.get(name)
    }

    /// `(primary_term, segments_gen)`, the total order checkpoints of one
    /// shard follow
    pub fn version(&self) -> (u64, u64) {
        (self.primary_term, self.segments_gen)
    }

    /// Compare positions in the checkpoint order
    pub fn compare_version(&self, other: &Self) -> Ordering {
        self.version().cmp(&other.version())
    }

    /// Strictly newer than `other`
    pub fn is_ahead_of(&self, other: &Self) -> bool {
        self.compare_version(other) == Ordering::Greater
    }

    /// Compute what a holder of `local` must fetch to reach this checkpoint
    pub fn diff_against(&self, local: &MetadataSnapshot) -> MetadataDiff {
        MetadataDiff::compute(local, &self.files)
    }
}

impl fmt::Display for ReplicationCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} term={} gen={} files={} size={}",
            self.shard_id,
            self.primary_term,
            self.segments_gen,
            self.files.len(),
            self.size
        )
    }
}

/// Difference between a local file set and a target file set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataDiff {
    /// Present locally and identical; reused without transfer
    pub identical: Vec<StoreFileMetadata>,
    /// Present locally under the same name with different contents
    pub different: Vec<StoreFileMetadata>,
    /// Not present locally
    pub missing: Vec<StoreFileMetadata>,
}

impl MetadataDiff {
    /// Entries are taken from `target` and come out ordered by name
    pub fn compute(local: &MetadataSnapshot, target: &MetadataSnapshot) -> Self {
        let mut diff = Self::default();
        for (name, meta) in target {
            match local.get(name) {
                Some(existing) if existing.is_same(meta) => diff.identical.push(meta.clone()),
                Some(_) => diff.different.push(meta.clone()),
                None => diff.missing.push(meta.clone()),
            }
        }
        diff
    }

    /// Files that must be transferred, ordered by name
    pub fn files_to_fetch(&self) -> Vec<StoreFileMetadata> {
        let mut files: Vec<_> = self
            .missing
            .iter()
            .chain(self.different.iter())
            .cloned()
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn bytes_to_fetch(&self) -> u64 {
        self.missing
            .iter()
            .chain(self.different.iter())
            .map(StoreFileMetadata::length)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.different.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        "logs/0".parse().unwrap()
    }

    fn file(name: &str, crc: u32, len: u64) -> StoreFileMetadata {
        StoreFileMetadata::new(name, len, Checksum::new(crc, u64::from(crc)))
    }

    fn snapshot(files: &[StoreFileMetadata]) -> MetadataSnapshot {
        files
            .iter()
            .map(|f| (f.name().to_string(), f.clone()))
            .collect()
    }

    #[test]
    fn test_diff_fetches_only_new_files() {
        let local = snapshot(&[file("a", 1, 10), file("b", 2, 5)]);
        let remote = ReplicationCheckpoint::new(shard(), 1, 2, [file("a", 1, 10), file("c", 3, 7)]);

        let diff = remote.diff_against(&local);
        assert_eq!(diff.files_to_fetch(), vec![file("c", 3, 7)]);
        assert_eq!(diff.identical, vec![file("a", 1, 10)]);
        assert_eq!(diff.bytes_to_fetch(), 7);
    }

    #[test]
    fn test_diff_refetches_changed_contents() {
        let local = snapshot(&[file("a", 1, 10), file("b", 2, 5)]);
        let target = snapshot(&[file("a", 9, 10), file("b", 2, 6)]);

        let diff = MetadataDiff::compute(&local, &target);
        assert!(diff.identical.is_empty());
        assert_eq!(diff.different.len(), 2);
        assert!(diff.missing.is_empty());
        assert_eq!(
            diff.files_to_fetch()
                .iter()
                .map(StoreFileMetadata::name)
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_identical_sets_need_nothing() {
        let files = [file("_0.cfs", 4, 100), file("segments_2", 5, 12)];
        let checkpoint = ReplicationCheckpoint::new(shard(), 3, 9, files.clone());
        let diff = checkpoint.diff_against(&snapshot(&files));
        assert!(diff.is_empty());
        assert!(diff.files_to_fetch().is_empty());
    }

    #[test]
    fn test_user_data_does_not_affect_identity() {
        let plain = file("a", 1, 10);
        let tagged = file("a", 1, 10).with_user_data("codec", "lucene99");
        assert!(plain.is_same(&tagged));
        assert_ne!(plain, tagged);
    }

    #[test]
    fn test_checkpoint_ordering() {
        let c1 = ReplicationCheckpoint::new(shard(), 1, 5, []);
        let c2 = ReplicationCheckpoint::new(shard(), 1, 6, []);
        let c3 = ReplicationCheckpoint::new(shard(), 2, 1, []);

        assert!(c2.is_ahead_of(&c1));
        assert!(c3.is_ahead_of(&c2));
        assert!(!c1.is_ahead_of(&c1));
        assert!(!c1.is_ahead_of(&c3));
        assert!(c1.is_ahead_of(&ReplicationCheckpoint::empty(shard())));
    }

    #[test]
    fn test_checkpoint_size_and_dedup() {
        let checkpoint = ReplicationCheckpoint::new(
            shard(),
            1,
            1,
            [file("a", 1, 10), file("b", 2, 5), file("a", 3, 20)],
        );
        assert_eq!(checkpoint.files().len(), 2);
        assert_eq!(checkpoint.size(), 25);
        assert_eq!(checkpoint.file("a").unwrap().length(), 20);
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let checkpoint = ReplicationCheckpoint::new(
            shard(),
            2,
            7,
            [file("_1.si", 8, 300).with_user_data("writer", "primary-a")],
        );
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: ReplicationCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("_0.cfs").is_ok());
        assert!(validate_file_name("segments_12").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name(".staging").is_err());
        assert!(validate_file_name("../escape").is_err());
        assert!(validate_file_name("a/b").is_err());
    }
}
