//! Repository caches
//!
//! A repository directory can carry a sibling cache file: a gzip-compressed
//! XML property list whose top-level value is a dictionary describing the
//! kexts found in the directory. The canonical cache path is the directory
//! path with the cache extension appended. A cache is current exactly when
//! its modification time equals the directory's modification time plus one
//! second; the comparison is equality, not at-least, so a directory touched
//! after the cache was written always invalidates it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use kextmgr_core::{Error, Result};

use crate::kext::{Kext, KextInfo};
use crate::manager::KextManager;
use crate::repository::Repository;

/// Extension appended to a repository directory path to name its cache
pub const REPOSITORY_CACHE_EXTENSION: &str = "kextcache";

const CACHE_FORMAT_VERSION: u32 = 1;

/// What a cache probe learned about a repository directory
#[derive(Debug, Clone)]
pub struct CacheStatus {
    /// Canonical cache path for the directory
    pub cache_path: PathBuf,
    /// Whether a regular cache file exists there
    pub exists: bool,
    /// Whether the cache is current with the directory
    pub is_current: bool,
    /// Whether the location allows writing a fresh cache
    pub can_update: bool,
}

/// On-disk shape of a cache: a dictionary of format version plus entries
#[derive(Debug, Serialize, Deserialize)]
struct CacheContents {
    version: u32,
    kexts: Vec<CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// Bundle path relative to the repository directory
    path: PathBuf,
    info: KextInfo,
}

/// The canonical cache path for a repository directory
pub fn repository_cache_path(directory: &Path) -> PathBuf {
    let mut os = directory.as_os_str().to_os_string();
    os.push(".");
    os.push(REPOSITORY_CACHE_EXTENSION);
    PathBuf::from(os)
}

/// Whether a cache written at `cache_mtime` is current for a directory
/// modified at `directory_mtime`
///
/// Current means the cache stamp sits exactly one second past the directory
/// stamp (the stamp the cache writer sets after writing).
pub fn cache_is_current(cache_mtime: SystemTime, directory_mtime: SystemTime) -> bool {
    let seconds = |t: SystemTime| {
        t.duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .ok()
    };
    match (seconds(cache_mtime), seconds(directory_mtime)) {
        (Some(cache), Some(directory)) => cache == directory + 1,
        _ => false,
    }
}

/// Probe a repository directory for a usable cache
pub fn check_repository_cache(directory: &Path) -> CacheStatus {
    let cache_path = repository_cache_path(directory);
    let mut status = CacheStatus {
        cache_path: cache_path.clone(),
        exists: false,
        is_current: false,
        can_update: false,
    };

    let Ok(directory_meta) = std::fs::metadata(directory) else {
        return status;
    };

    if let Ok(cache_meta) = std::fs::metadata(&cache_path) {
        if cache_meta.is_file() {
            status.exists = true;
            if let (Ok(cache_mtime), Ok(directory_mtime)) =
                (cache_meta.modified(), directory_meta.modified())
            {
                status.is_current = cache_is_current(cache_mtime, directory_mtime);
            }
        } else {
            error!(path = %cache_path.display(), "cache file is not a regular file");
            return status;
        }
    }

    if let Some(parent) = directory.parent() {
        if let Ok(parent_meta) = std::fs::metadata(parent) {
            status.can_update = !parent_meta.permissions().readonly();
        }
    }

    status
}

/// Read a cache file into its top-level dictionary
pub fn read_cache_dictionary(path: &Path) -> Result<plist::Value> {
    let file = std::fs::File::open(path).map_err(|err| {
        error!(path = %path.display(), %err, "cannot open kext cache file for reading");
        Error::file_access(path.display().to_string())
    })?;

    let mut decoder = GzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes).map_err(|err| {
        error!(path = %path.display(), %err, "error reading from kext cache file");
        Error::Compression
    })?;

    let value = plist::Value::from_reader_xml(bytes.as_slice()).map_err(|err| {
        error!(path = %path.display(), %err, "error reading cache data");
        Error::cache(path.display().to_string())
    })?;

    if !matches!(value, plist::Value::Dictionary(_)) {
        error!(path = %path.display(), "cache file contains invalid data");
        return Err(Error::invalid_argument("cache top level is not a dictionary"));
    }
    Ok(value)
}

/// Reconstruct a repository from a cache dictionary and its directory
pub fn repository_from_cache_dictionary(
    dictionary: plist::Value,
    directory: &Path,
) -> Result<Repository> {
    let contents: CacheContents = plist::from_value(&dictionary)
        .map_err(|_| Error::cache(directory.display().to_string()))?;
    if contents.version != CACHE_FORMAT_VERSION {
        return Err(Error::cache(directory.display().to_string()));
    }

    let mut repository = Repository::new(directory, true);
    for entry in contents.kexts {
        let path = directory.join(&entry.path);
        repository.add_kext(Kext::new(entry.info, path));
    }
    Ok(repository)
}

/// Write a repository's candidate kexts out as a cache file
pub fn write_repository_cache(repository: &Repository, path: &Path) -> Result<()> {
    let contents = CacheContents {
        version: CACHE_FORMAT_VERSION,
        kexts: repository
            .candidate_slots()
            .iter()
            .filter_map(|&slot| repository.kext(slot))
            .map(|kext| CacheEntry {
                path: kext
                    .path()
                    .strip_prefix(repository.directory())
                    .unwrap_or(kext.path())
                    .to_path_buf(),
                info: kext_info_of(kext),
            })
            .collect(),
    };

    let file = std::fs::File::create(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return Error::DiskFull;
        }
        error!(path = %path.display(), %err, "cannot open kext cache file for writing");
        Error::file_access(path.display().to_string())
    })?;

    let mut encoder = GzEncoder::new(file, Compression::default());
    let mut bytes = Vec::new();
    plist::to_writer_xml(&mut bytes, &contents).map_err(|_| Error::Serialization)?;
    encoder.write_all(&bytes).map_err(|_| Error::Compression)?;
    encoder.finish().map_err(|_| Error::Compression)?;
    Ok(())
}

fn kext_info_of(kext: &Kext) -> KextInfo {
    let mut info = KextInfo::new(kext.identifier(), kext.version());
    info.compatible_version = kext.compatible_version();
    info.enabled = kext.is_enabled();
    info.safe_boot_eligible = kext.is_eligible_during_safe_boot();
    info.has_executable = kext.has_executable();
    info.libraries = kext.libraries().to_vec();
    info.personalities = kext.copy_personalities();
    info
}

impl KextManager {
    /// Register a repository directory, reconstructing it from a current
    /// cache when one is available
    ///
    /// Full-tests mode always bypasses caches. A stale or unreadable cache
    /// falls back to a plain (empty, scanner-populated) repository.
    pub fn add_repository_with_cache(
        &mut self,
        directory: &Path,
        scans_for_kexts: bool,
        use_cache: bool,
    ) -> Result<usize> {
        let use_cache = use_cache && !self.performs_full_tests();

        if let Some(existing) = self.repository_index_for_directory(directory) {
            debug!(directory = %directory.display(), "repository exists");
            return Ok(existing);
        }

        if use_cache {
            let status = check_repository_cache(directory);
            if status.exists && status.is_current {
                match read_cache_dictionary(&status.cache_path)
                    .and_then(|dict| repository_from_cache_dictionary(dict, directory))
                {
                    Ok(repository) => {
                        debug!(directory = %directory.display(), "added repository from cache");
                        return Ok(self.install_repository(repository));
                    }
                    Err(err) => {
                        error!(
                            directory = %directory.display(),
                            %err,
                            "error using cache; using repository itself"
                        );
                    }
                }
            }
        }

        self.add_repository(directory, scans_for_kexts)
    }
}
