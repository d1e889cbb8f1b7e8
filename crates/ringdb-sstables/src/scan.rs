//! Directory scanning: groups component files by generation and decides
//! which generations are complete and which files must go.
//!
//! A generation is complete once its TOC is present. A temporary TOC means
//! the write was interrupted, so every file of that generation is scheduled
//! for removal whatever else exists. Nothing is deleted here; removals are
//! only collected.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::component::{ComponentType, EntryDescriptor, SstableVersion};
use crate::error::{SstError, SstResult};
use crate::ownership::{shard_for_generation, ShardId};
use crate::sstable::Generation;

/// What to do with a generation that never acquired a TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MissingTocPolicy {
    /// Fail the scan.
    Fatal,
    /// Schedule the generation's files for removal.
    #[default]
    Remove,
}

/// Returns false for directory entries that are never SSTable components,
/// such as snapshot manifests and hidden files.
pub fn manifest_filter(name: &str) -> bool {
    !(name == "manifest.json" || name == "schema.cql" || name.starts_with('.'))
}

/// Per-scan accumulation of what was found on disk.
#[derive(Debug, Default)]
pub struct ScanState {
    generations_found: HashMap<Generation, Vec<PathBuf>>,
    temp_toc_found: Vec<EntryDescriptor>,
    descriptors: HashMap<Generation, EntryDescriptor>,
}

impl ScanState {
    /// Records one component file.
    pub fn handle_component(
        &mut self,
        desc: EntryDescriptor,
        path: PathBuf,
        files_for_removal: &mut BTreeSet<PathBuf>,
    ) {
        self.generations_found
            .entry(desc.generation)
            .or_default()
            .push(path.clone());
        match desc.component {
            ComponentType::TemporaryStatistics => {
                files_for_removal.insert(path);
            }
            ComponentType::Toc => {
                self.descriptors.insert(desc.generation, desc);
            }
            ComponentType::TemporaryToc => {
                self.temp_toc_found.push(desc);
            }
            _ => {}
        }
    }

    /// Settles the scan: interrupted and incomplete generations go to the
    /// removal set, complete ones are returned in generation order.
    pub fn finish(
        mut self,
        dir: &Path,
        policy: MissingTocPolicy,
        mut files_for_removal: BTreeSet<PathBuf>,
    ) -> SstResult<ScanOutcome> {
        // Always safe to drop interrupted writes before looking at the rest.
        for desc in std::mem::take(&mut self.temp_toc_found) {
            if let Some(paths) = self.generations_found.remove(&desc.generation) {
                debug!(generation = desc.generation, files = paths.len(), "removing interrupted sstable");
                files_for_removal.extend(paths);
            }
            self.descriptors.remove(&desc.generation);
        }

        let max_generation_seen = self.generations_found.keys().copied().max().unwrap_or(0);

        let mut descriptors: Vec<EntryDescriptor> = self.descriptors.into_values().collect();
        descriptors.sort_by_key(|d| d.generation);
        for desc in &descriptors {
            self.generations_found.remove(&desc.generation);
        }

        let mut incomplete: Vec<(Generation, Vec<PathBuf>)> =
            self.generations_found.into_iter().collect();
        incomplete.sort_by_key(|(generation, _)| *generation);
        for (generation, paths) in incomplete {
            match policy {
                MissingTocPolicy::Fatal => {
                    return Err(SstError::MissingToc {
                        dir: dir.to_path_buf(),
                        generation,
                    });
                }
                MissingTocPolicy::Remove => {
                    info!(generation, dir = %dir.display(), "partial sstable without TOC scheduled for removal");
                    files_for_removal.extend(paths);
                }
            }
        }

        let max_version_seen = descriptors
            .iter()
            .map(|d| d.version)
            .max()
            .unwrap_or_default();

        Ok(ScanOutcome {
            descriptors,
            files_for_removal,
            max_generation_seen,
            max_version_seen,
        })
    }
}

/// Result of one directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// TOC descriptors of complete generations, ordered by generation.
    pub descriptors: Vec<EntryDescriptor>,
    /// Files to delete once the removal is committed.
    pub files_for_removal: BTreeSet<PathBuf>,
    /// Highest generation left after dropping interrupted writes.
    pub max_generation_seen: Generation,
    /// Highest version among complete generations.
    pub max_version_seen: SstableVersion,
}

/// Scans one directory on behalf of one shard.
#[derive(Debug, Clone)]
pub struct Scanner {
    dir: PathBuf,
    shard: ShardId,
    shard_count: u32,
    policy: MissingTocPolicy,
}

impl Scanner {
    /// Creates a scanner. Only generations with
    /// `generation % shard_count == shard` are considered.
    pub fn new(dir: impl Into<PathBuf>, shard: ShardId, shard_count: u32, policy: MissingTocPolicy) -> Self {
        Self {
            dir: dir.into(),
            shard,
            shard_count,
            policy,
        }
    }

    /// Walks the directory once.
    pub async fn scan(&self) -> SstResult<ScanOutcome> {
        let mut state = ScanState::default();
        let mut files_for_removal = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SstError::from_io(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SstError::from_io(&self.dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SstError::from_io(&entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %entry.path().display(), "ignoring non UTF-8 file name");
                continue;
            };
            if !manifest_filter(name) {
                continue;
            }
            let desc = match EntryDescriptor::parse(&self.dir, name) {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(dir = %self.dir.display(), "ignoring unrecognized file: {}", e);
                    continue;
                }
            };
            if shard_for_generation(desc.generation, self.shard_count) != self.shard {
                continue;
            }
            state.handle_component(desc, entry.path(), &mut files_for_removal);
        }

        let outcome = state.finish(&self.dir, self.policy, files_for_removal)?;
        debug!(
            dir = %self.dir.display(),
            shard = self.shard.as_u32(),
            complete = outcome.descriptors.len(),
            removals = outcome.files_for_removal.len(),
            "directory scanned"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    fn scanner(dir: &Path, policy: MissingTocPolicy) -> Scanner {
        Scanner::new(dir, ShardId::new(0), 1, policy)
    }

    #[test]
    fn test_manifest_filter() {
        assert!(!manifest_filter("manifest.json"));
        assert!(!manifest_filter(".hidden"));
        assert!(manifest_filter("me-1-big-Data.db"));
    }

    #[tokio::test]
    async fn test_complete_generation_found() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "me-1-big-Data.db");
        touch(dir.path(), "me-1-big-TOC.txt");
        let outcome = scanner(dir.path(), MissingTocPolicy::Fatal).scan().await.unwrap();
        assert_eq!(outcome.descriptors.len(), 1);
        assert_eq!(outcome.descriptors[0].component, ComponentType::Toc);
        assert!(outcome.files_for_removal.is_empty());
        assert_eq!(outcome.max_generation_seen, 1);
        assert_eq!(outcome.max_version_seen, SstableVersion::Me);
    }

    #[tokio::test]
    async fn test_temporary_toc_removes_whole_generation() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "me-2-big-Data.db");
        touch(dir.path(), "me-2-big-TOC.txt");
        touch(dir.path(), "me-2-big-TOC.txt.tmp");
        let outcome = scanner(dir.path(), MissingTocPolicy::Fatal).scan().await.unwrap();
        assert!(outcome.descriptors.is_empty());
        assert_eq!(outcome.files_for_removal.len(), 3);
        assert_eq!(outcome.max_generation_seen, 0);
    }

    #[tokio::test]
    async fn test_missing_toc_policy() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "me-3-big-Data.db");

        let err = scanner(dir.path(), MissingTocPolicy::Fatal).scan().await.unwrap_err();
        assert!(matches!(err, SstError::MissingToc { generation: 3, .. }));

        let outcome = scanner(dir.path(), MissingTocPolicy::Remove).scan().await.unwrap();
        assert!(outcome.descriptors.is_empty());
        assert!(outcome.files_for_removal.contains(&dir.path().join("me-3-big-Data.db")));
    }

    #[tokio::test]
    async fn test_temporary_statistics_removed_but_generation_kept() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "me-4-big-Data.db");
        touch(dir.path(), "me-4-big-TOC.txt");
        touch(dir.path(), "me-4-big-Statistics.db.tmp");
        let outcome = scanner(dir.path(), MissingTocPolicy::Fatal).scan().await.unwrap();
        assert_eq!(outcome.descriptors.len(), 1);
        assert_eq!(outcome.files_for_removal.len(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_and_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "manifest.json");
        touch(dir.path(), "garbage.bin");
        std::fs::create_dir(dir.path().join("upload")).unwrap();
        touch(dir.path(), "me-5-big-TOC.txt");
        touch(dir.path(), "me-6-big-TOC.txt");

        let shard0 = Scanner::new(dir.path(), ShardId::new(0), 2, MissingTocPolicy::Fatal);
        let outcome = shard0.scan().await.unwrap();
        let gens: Vec<_> = outcome.descriptors.iter().map(|d| d.generation).collect();
        assert_eq!(gens, vec![6]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_storage_fault() {
        let dir = TempDir::new().unwrap();
        let err = scanner(&dir.path().join("nope"), MissingTocPolicy::Fatal)
            .scan()
            .await
            .unwrap_err();
        assert!(err.is_storage_fault());
    }
}
