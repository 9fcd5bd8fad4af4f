//! Configuration structures for strata.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a disk configuration file.
pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";

/// Storage backend used for a configured disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file accessed with positional read/write system calls.
    #[default]
    Syscall,
    /// Growable in-memory byte array (simulated disk).
    Memory,
}

impl std::str::FromStr for FileKind {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "syscall" | "file" => Ok(Self::Syscall),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(StrataError::invalid_parameter("io_impl", other)),
        }
    }
}

/// Service order of a disk queue when both reads and writes are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriorityOp {
    /// Drain pending reads before any write.
    Read,
    /// Drain pending writes before any read.
    #[default]
    Write,
    /// Alternate one read and one write while both queues are non-empty.
    None,
}

/// Configuration of one physical disk (one file, one queue, one worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path of the backing file (ignored for memory disks).
    pub path: PathBuf,
    /// Initial capacity in bytes.
    pub capacity: u64,
    /// Backend implementation.
    pub kind: FileKind,
    /// Extend the file when the allocator runs out of space.
    pub autogrow: bool,
    /// Remove the backing file when the block manager shuts down.
    pub delete_on_drop: bool,
}

impl DiskConfig {
    /// A growable in-memory disk.
    pub fn memory() -> Self {
        Self {
            path: PathBuf::new(),
            capacity: 0,
            kind: FileKind::Memory,
            autogrow: true,
            delete_on_drop: false,
        }
    }

    /// A growable on-disk file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: 0,
            kind: FileKind::Syscall,
            autogrow: true,
            delete_on_drop: false,
        }
    }

    /// Parses one `disk=<path>,<capacity>,<kind>[,<flag>...]` line.
    ///
    /// Capacity accepts SI (`K`, `M`, `G`, `T`) and IEC (`KiB`, `MiB`, ...)
    /// suffixes; a bare number counts megabytes. A capacity of zero, or the
    /// `autogrow` flag, lets the file grow on demand. The `delete` flag
    /// removes the file at shutdown.
    pub fn parse_line(line: &str) -> Result<Self> {
        let body = line
            .trim()
            .strip_prefix("disk=")
            .ok_or_else(|| StrataError::ConfigError(format!("not a disk line: {line}")))?;

        let mut fields = body.split(',');
        let path = fields
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StrataError::ConfigError(format!("missing path: {line}")))?;
        let capacity = match fields.next() {
            Some(c) => parse_size(c)?,
            None => 0,
        };
        let kind = match fields.next() {
            Some(k) => k.parse()?,
            None => FileKind::default(),
        };

        let mut config = Self {
            path: PathBuf::from(path),
            capacity,
            kind,
            autogrow: capacity == 0,
            delete_on_drop: false,
        };
        for flag in fields {
            match flag.trim() {
                "autogrow" => config.autogrow = true,
                "delete" | "unlink" => config.delete_on_drop = true,
                "" => {}
                other => return Err(StrataError::invalid_parameter("disk flag", other)),
            }
        }
        Ok(config)
    }
}

/// Parses a size with an optional SI or IEC suffix. Bare numbers are megabytes.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| StrataError::invalid_parameter("size", text))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "m" | "mb" => 1000 * 1000,
        "b" => 1,
        "k" | "kb" => 1000,
        "g" | "gb" => 1000 * 1000 * 1000,
        "t" | "tb" => 1000 * 1000 * 1000 * 1000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        _ => return Err(StrataError::invalid_parameter("size", text)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| StrataError::invalid_parameter("size", text))
}

/// I/O configuration: the set of disks and the queue policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Configured disks, one queue and worker thread each.
    pub disks: Vec<DiskConfig>,
    /// Initial priority policy of every disk queue.
    pub queue_priority: PriorityOp,
}

impl Default for IoConfig {
    fn default() -> Self {
        let path = std::env::temp_dir().join(format!("strata.{}.tmp", std::process::id()));
        let mut disk = DiskConfig::file(path);
        disk.delete_on_drop = true;
        Self {
            disks: vec![disk],
            queue_priority: PriorityOp::default(),
        }
    }
}

impl IoConfig {
    /// `count` growable in-memory disks.
    pub fn memory(count: usize) -> Self {
        Self {
            disks: (0..count).map(|_| DiskConfig::memory()).collect(),
            queue_priority: PriorityOp::default(),
        }
    }

    /// Parses a configuration file body: one `disk=` line per disk, blank
    /// lines and `#` comments ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let disks = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(DiskConfig::parse_line)
            .collect::<Result<Vec<_>>>()?;
        if disks.is_empty() {
            return Err(StrataError::ConfigError("no disk lines".to_string()));
        }
        Ok(Self {
            disks,
            queue_priority: PriorityOp::default(),
        })
    }

    /// Reads and parses a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Loads the file named by `STRATA_CONFIG`, or the default single
    /// temporary disk when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Returns the number of configured disks.
    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }
}

/// Replacement policy of a node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Evict the least recently unpinned entry.
    #[default]
    Lru,
    /// Second-chance clock sweep.
    Clock,
}

/// Configuration of one node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of blocks the cache may hold.
    pub capacity_blocks: usize,
    /// Replacement policy.
    pub policy: ReplacementPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 64,
            policy: ReplacementPolicy::default(),
        }
    }
}

/// Block allocation strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Consecutive blocks on consecutive disks.
    #[default]
    Striping,
    /// Random start disk, then striping.
    SimpleRandom,
    /// Every block on an independently random disk.
    FullyRandom,
    /// Striping over a random permutation of the disks.
    RandomCyclic,
    /// Every block on one disk.
    SingleDisk(u32),
}

/// Configuration of one B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Block size of internal nodes in bytes.
    pub node_block_size: usize,
    /// Block size of leaves in bytes.
    pub leaf_block_size: usize,
    /// Cache of internal nodes.
    pub node_cache: CacheConfig,
    /// Cache of leaves.
    pub leaf_cache: CacheConfig,
    /// Strategy used to place new nodes and leaves.
    pub strategy: StrategyKind,
    /// Target fill of internal nodes during bulk construction.
    pub node_fill_factor: f64,
    /// Target fill of leaves during bulk construction.
    pub leaf_fill_factor: f64,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            node_block_size: 16 * 1024,
            leaf_block_size: 128 * 1024,
            node_cache: CacheConfig::default(),
            leaf_cache: CacheConfig::default(),
            strategy: StrategyKind::default(),
            node_fill_factor: 0.75,
            leaf_fill_factor: 0.6,
        }
    }
}

impl BTreeConfig {
    /// Checks the values the tree cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_cache.capacity_blocks < 2 {
            return Err(StrataError::invalid_parameter(
                "node_cache.capacity_blocks",
                self.node_cache.capacity_blocks,
            ));
        }
        if self.leaf_cache.capacity_blocks < 2 {
            return Err(StrataError::invalid_parameter(
                "leaf_cache.capacity_blocks",
                self.leaf_cache.capacity_blocks,
            ));
        }
        if !(0.5..=1.0).contains(&self.node_fill_factor) {
            return Err(StrataError::invalid_parameter(
                "node_fill_factor",
                self.node_fill_factor,
            ));
        }
        if !(0.5..=1.0).contains(&self.leaf_fill_factor) {
            return Err(StrataError::invalid_parameter(
                "leaf_fill_factor",
                self.leaf_fill_factor,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("4096b").unwrap(), 4096);
        assert_eq!(parse_size("1").unwrap(), 1_000_000);
        assert_eq!(parse_size("2K").unwrap(), 2000);
        assert_eq!(parse_size("2KiB").unwrap(), 2048);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("3 G").unwrap(), 3_000_000_000);
        assert!(parse_size("12parsecs").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_disk_line_parse() {
        let disk = DiskConfig::parse_line("disk=/var/tmp/stripe0,1GiB,syscall").unwrap();
        assert_eq!(disk.path, PathBuf::from("/var/tmp/stripe0"));
        assert_eq!(disk.capacity, 1 << 30);
        assert_eq!(disk.kind, FileKind::Syscall);
        assert!(!disk.autogrow);
        assert!(!disk.delete_on_drop);

        let disk = DiskConfig::parse_line("disk=/tmp/x,0,memory,delete").unwrap();
        assert_eq!(disk.kind, FileKind::Memory);
        assert!(disk.autogrow);
        assert!(disk.delete_on_drop);
    }

    #[test]
    fn test_disk_line_rejects_garbage() {
        assert!(DiskConfig::parse_line("memory=1G").is_err());
        assert!(DiskConfig::parse_line("disk=,1G,syscall").is_err());
        assert!(DiskConfig::parse_line("disk=/tmp/x,1G,tape").is_err());
        assert!(DiskConfig::parse_line("disk=/tmp/x,1G,syscall,sparkly").is_err());
    }

    #[test]
    fn test_io_config_parse_file_body() {
        let text = "# two stripes\n\ndisk=/tmp/a,100MiB,syscall\ndisk=/tmp/b,0,memory\n";
        let config = IoConfig::parse(text).unwrap();
        assert_eq!(config.num_disks(), 2);
        assert_eq!(config.disks[0].capacity, 100 << 20);
        assert_eq!(config.disks[1].kind, FileKind::Memory);
        assert_eq!(config.queue_priority, PriorityOp::Write);

        assert!(IoConfig::parse("# nothing here\n").is_err());
    }

    #[test]
    fn test_io_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".strata");
        std::fs::write(&path, "disk=/tmp/strata-test,16MiB,syscall,autogrow\n").unwrap();

        let config = IoConfig::from_file(&path).unwrap();
        assert_eq!(config.num_disks(), 1);
        assert!(config.disks[0].autogrow);
    }

    #[test]
    fn test_io_config_defaults() {
        let config = IoConfig::default();
        assert_eq!(config.num_disks(), 1);
        assert!(config.disks[0].autogrow);
        assert!(config.disks[0].delete_on_drop);
        assert_eq!(config.disks[0].kind, FileKind::Syscall);

        let memory = IoConfig::memory(4);
        assert_eq!(memory.num_disks(), 4);
        assert!(memory.disks.iter().all(|d| d.kind == FileKind::Memory));
    }

    #[test]
    fn test_io_config_serde_roundtrip() {
        let original = IoConfig::memory(2);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: IoConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_btree_config_defaults() {
        let config = BTreeConfig::default();
        assert_eq!(config.node_block_size, 16 * 1024);
        assert_eq!(config.leaf_block_size, 128 * 1024);
        assert_eq!(config.node_cache.policy, ReplacementPolicy::Lru);
        assert_eq!(config.strategy, StrategyKind::Striping);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_btree_config_validate() {
        let config = BTreeConfig {
            leaf_fill_factor: 0.3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BTreeConfig {
            node_cache: CacheConfig {
                capacity_blocks: 1,
                policy: ReplacementPolicy::Clock,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_btree_config_serde_roundtrip() {
        let original = BTreeConfig {
            strategy: StrategyKind::SingleDisk(2),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: BTreeConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_file_kind_from_str() {
        assert_eq!("syscall".parse::<FileKind>().unwrap(), FileKind::Syscall);
        assert_eq!("memory".parse::<FileKind>().unwrap(), FileKind::Memory);
        assert!("mmap".parse::<FileKind>().is_err());
    }
}
