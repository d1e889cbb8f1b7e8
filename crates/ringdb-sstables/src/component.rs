//! SSTable component files and their names.
//!
//! Component files are named `<version>-<generation>-<format>-<Component>`
//! (for example `mc-12-big-Data.db`), except for the oldest `ka` version
//! which prefixes keyspace and table: `ks-cf-ka-12-Data.db`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SstError, SstResult};
use crate::sstable::Generation;

/// On-disk format version of an SSTable, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum SstableVersion {
    /// Legacy version with keyspace/table in file names.
    #[default]
    Ka,
    /// First version with short names.
    La,
    /// 3.x storage format.
    Mc,
    /// 3.x format with improved tombstone metadata.
    Md,
    /// Latest format.
    Me,
}

impl SstableVersion {
    /// Every known version, oldest first.
    pub const ALL: [SstableVersion; 5] = [
        SstableVersion::Ka,
        SstableVersion::La,
        SstableVersion::Mc,
        SstableVersion::Md,
        SstableVersion::Me,
    ];

    /// Returns the name used in file names.
    pub fn as_str(self) -> &'static str {
        match self {
            SstableVersion::Ka => "ka",
            SstableVersion::La => "la",
            SstableVersion::Mc => "mc",
            SstableVersion::Md => "md",
            SstableVersion::Me => "me",
        }
    }

    /// Parses a version from its file name form.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for SstableVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical layout family of an SSTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SstableFormat {
    /// The only format in use.
    #[default]
    Big,
}

impl SstableFormat {
    /// Returns the name used in file names.
    pub fn as_str(self) -> &'static str {
        match self {
            SstableFormat::Big => "big",
        }
    }

    /// Parses a format from its file name form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "big" => Some(SstableFormat::Big),
            _ => None,
        }
    }
}

impl std::fmt::Display for SstableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of an SSTable's component family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentType {
    /// Row data.
    Data,
    /// Partition index.
    Index,
    /// Sampled index summary.
    Summary,
    /// Bloom filter.
    Filter,
    /// Compression chunk offsets.
    CompressionInfo,
    /// Statistics and timestamps.
    Statistics,
    /// Whole-file digest.
    Digest,
    /// Per-chunk checksums.
    Crc,
    /// Sharding and feature metadata.
    Scylla,
    /// Table of contents; its presence marks a complete SSTable.
    Toc,
    /// Table of contents still being written.
    TemporaryToc,
    /// Statistics still being rewritten.
    TemporaryStatistics,
}

impl ComponentType {
    /// Every component type.
    pub const ALL: [ComponentType; 12] = [
        ComponentType::Data,
        ComponentType::Index,
        ComponentType::Summary,
        ComponentType::Filter,
        ComponentType::CompressionInfo,
        ComponentType::Statistics,
        ComponentType::Digest,
        ComponentType::Crc,
        ComponentType::Scylla,
        ComponentType::Toc,
        ComponentType::TemporaryToc,
        ComponentType::TemporaryStatistics,
    ];

    /// Returns the file name suffix of this component.
    pub fn suffix(self) -> &'static str {
        match self {
            ComponentType::Data => "Data.db",
            ComponentType::Index => "Index.db",
            ComponentType::Summary => "Summary.db",
            ComponentType::Filter => "Filter.db",
            ComponentType::CompressionInfo => "CompressionInfo.db",
            ComponentType::Statistics => "Statistics.db",
            ComponentType::Digest => "Digest.crc32",
            ComponentType::Crc => "CRC.db",
            ComponentType::Scylla => "Scylla.db",
            ComponentType::Toc => "TOC.txt",
            ComponentType::TemporaryToc => "TOC.txt.tmp",
            ComponentType::TemporaryStatistics => "Statistics.db.tmp",
        }
    }

    /// Parses a component from its file name suffix.
    pub fn from_suffix(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.suffix() == s)
    }
}

/// Builds the file name of one component.
pub fn component_filename(
    version: SstableVersion,
    generation: Generation,
    format: SstableFormat,
    component: ComponentType,
) -> String {
    format!("{}-{}-{}-{}", version, generation, format, component.suffix())
}

/// Parsed identity of one component file found in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    /// Directory containing the file.
    pub dir: PathBuf,
    /// Keyspace name, only recorded by `ka` file names.
    pub keyspace: Option<String>,
    /// Table name, only recorded by `ka` file names.
    pub table: Option<String>,
    /// Generation of the component family.
    pub generation: Generation,
    /// Format version.
    pub version: SstableVersion,
    /// Layout family.
    pub format: SstableFormat,
    /// Which component this file is.
    pub component: ComponentType,
}

impl EntryDescriptor {
    /// Parses a component file name found in `dir`.
    pub fn parse(dir: &Path, name: &str) -> SstResult<Self> {
        let malformed = |reason: &str| SstError::MalformedFilename {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = name.splitn(4, '-').collect();
        if parts.len() < 4 {
            return Err(malformed("too few fields"));
        }

        // ka names carry keyspace and table first: ks-cf-ka-<gen>-<Component>
        if SstableVersion::parse(parts[0]).is_none() {
            let ka: Vec<&str> = name.splitn(5, '-').collect();
            if ka.len() != 5 || ka[2] != SstableVersion::Ka.as_str() {
                return Err(malformed("unknown version"));
            }
            let generation = parse_generation(ka[3]).ok_or_else(|| malformed("bad generation"))?;
            let component =
                ComponentType::from_suffix(ka[4]).ok_or_else(|| malformed("unknown component"))?;
            return Ok(Self {
                dir: dir.to_path_buf(),
                keyspace: Some(ka[0].to_string()),
                table: Some(ka[1].to_string()),
                generation,
                version: SstableVersion::Ka,
                format: SstableFormat::Big,
                component,
            });
        }

        let version = SstableVersion::parse(parts[0]).ok_or_else(|| malformed("unknown version"))?;
        let generation = parse_generation(parts[1]).ok_or_else(|| malformed("bad generation"))?;
        let format = SstableFormat::parse(parts[2]).ok_or_else(|| malformed("unknown format"))?;
        let component =
            ComponentType::from_suffix(parts[3]).ok_or_else(|| malformed("unknown component"))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            keyspace: None,
            table: None,
            generation,
            version,
            format,
            component,
        })
    }

    /// Full path of the file this descriptor was parsed from.
    pub fn path(&self) -> PathBuf {
        match (self.version, &self.keyspace, &self.table) {
            (SstableVersion::Ka, Some(ks), Some(cf)) => self.dir.join(format!(
                "{}-{}-ka-{}-{}",
                ks,
                cf,
                self.generation,
                self.component.suffix()
            )),
            _ => self.dir.join(component_filename(
                self.version,
                self.generation,
                self.format,
                self.component,
            )),
        }
    }
}

fn parse_generation(s: &str) -> Option<Generation> {
    let generation: Generation = s.parse().ok()?;
    (generation > 0).then_some(generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_component() {
        let desc = EntryDescriptor::parse(Path::new("/d"), "mc-12-big-Data.db").unwrap();
        assert_eq!(desc.generation, 12);
        assert_eq!(desc.version, SstableVersion::Mc);
        assert_eq!(desc.format, SstableFormat::Big);
        assert_eq!(desc.component, ComponentType::Data);
        assert_eq!(desc.path(), PathBuf::from("/d/mc-12-big-Data.db"));
    }

    #[test]
    fn test_parse_temporary_components() {
        let toc = EntryDescriptor::parse(Path::new("/d"), "me-3-big-TOC.txt.tmp").unwrap();
        assert_eq!(toc.component, ComponentType::TemporaryToc);
        let stats = EntryDescriptor::parse(Path::new("/d"), "md-4-big-Statistics.db.tmp").unwrap();
        assert_eq!(stats.component, ComponentType::TemporaryStatistics);
    }

    #[test]
    fn test_parse_ka_name() {
        let desc = EntryDescriptor::parse(Path::new("/d"), "ks-cf-ka-5-TOC.txt").unwrap();
        assert_eq!(desc.version, SstableVersion::Ka);
        assert_eq!(desc.generation, 5);
        assert_eq!(desc.keyspace.as_deref(), Some("ks"));
        assert_eq!(desc.table.as_deref(), Some("cf"));
        assert_eq!(desc.path(), PathBuf::from("/d/ks-cf-ka-5-TOC.txt"));
    }

    #[test]
    fn test_rejects_garbage() {
        for name in [
            "manifest.json",
            "mc-x-big-Data.db",
            "mc-0-big-Data.db",
            "mc-1-small-Data.db",
            "mc-1-big-Unknown.db",
            "zz-1-big-Data.db",
        ] {
            let err = EntryDescriptor::parse(Path::new("/d"), name).unwrap_err();
            assert!(matches!(err, SstError::MalformedFilename { .. }), "{}", name);
        }
    }

    #[test]
    fn test_component_filename() {
        assert_eq!(
            component_filename(SstableVersion::Me, 42, SstableFormat::Big, ComponentType::Toc),
            "me-42-big-TOC.txt"
        );
    }

    #[test]
    fn test_version_ordering() {
        assert!(SstableVersion::Ka < SstableVersion::Me);
        assert!(SstableVersion::Mc < SstableVersion::Md);
    }
}
