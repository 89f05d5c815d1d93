//! Replay index over the on-disk recording tree.
//!
//! Recording filenames look like `<prefix>_<start>[_<finish>].ts`. The index
//! walks a `(room, project)` directory on demand, hashing each file once and
//! remembering the digest in `replay.json` keyed by `(path, size)`. A
//! background sweeper drops entries whose file disappeared.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A replayable recording, as exposed by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    pub addr: String,
    pub size: u64,
    pub md5: String,
    pub start: String,
    pub finish: String,
}

/// One persisted hash-cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFile {
    #[serde(rename = "filePath")]
    pub file_path: PathBuf,
    pub size: u64,
    #[serde(rename = "Md5")]
    pub md5: String,
    pub start: String,
    pub finish: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    files: Vec<CachedFile>,
}

/// A file found by a directory scan; `name` is the bare filename so the
/// caller can build the public replay address.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub name: String,
    pub size: u64,
    pub md5: String,
    pub start: String,
    pub finish: String,
}

pub struct ReplayIndex {
    cache_path: PathBuf,
    files: Mutex<Vec<CachedFile>>,
}

impl ReplayIndex {
    /// Load the persisted cache, or start empty when the file is missing or
    /// unreadable.
    #[must_use]
    pub fn load(cache_path: PathBuf) -> Self {
        let files = match std::fs::read_to_string(&cache_path) {
            Ok(data) => match serde_json::from_str::<CacheFile>(&data) {
                Ok(cache) => {
                    info!(entries = cache.files.len(), "loaded replay cache");
                    cache.files
                }
                Err(err) => {
                    warn!(%err, "replay cache unreadable, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            cache_path,
            files: Mutex::new(files),
        }
    }

    /// Rewrite the cache file atomically (temp file + rename).
    pub fn persist(&self) -> Result<()> {
        let snapshot = CacheFile {
            files: self.files.lock().unwrap().clone(),
        };
        let data = serde_json::to_vec(&snapshot)?;
        let tmp = self.cache_path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.cache_path)?;
        Ok(())
    }

    /// Scan a recording directory. Returns one entry per parseable file,
    /// hashing files not already cached under `(path, size)`.
    ///
    /// A missing directory is not an error: the project simply has no
    /// recordings there yet.
    pub fn scan_dir(&self, dir: &Path) -> Result<Vec<ScannedFile>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut scanned = Vec::new();
        let mut dirty = false;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((start, finish)) = parse_recording_name(name) else {
                warn!(file = %path.display(), "recording name does not parse, skipped");
                continue;
            };

            let size = metadata.len();
            let md5 = match self.cached_md5(&path, size) {
                Some(md5) => md5,
                None => {
                    debug!(file = %path.display(), "hashing recording");
                    let md5 = file_md5(&path)?;
                    self.files.lock().unwrap().push(CachedFile {
                        file_path: path.clone(),
                        size,
                        md5: md5.clone(),
                        start: start.clone(),
                        finish: finish.clone(),
                    });
                    dirty = true;
                    md5
                }
            };

            scanned.push(ScannedFile {
                name: name.to_string(),
                size,
                md5,
                start,
                finish,
            });
        }

        if dirty {
            self.persist()?;
        }
        Ok(scanned)
    }

    /// Drop cache entries whose file no longer exists, then persist.
    pub fn sweep(&self) -> Result<()> {
        let removed = {
            let mut files = self.files.lock().unwrap();
            let before = files.len();
            files.retain(|f| f.file_path.exists());
            before - files.len()
        };
        if removed > 0 {
            info!(removed, "replay sweep dropped stale entries");
        }
        self.persist()
    }

    fn cached_md5(&self, path: &Path, size: u64) -> Option<String> {
        let files = self.files.lock().unwrap();
        files
            .iter()
            .find(|f| f.file_path == path && f.size == size)
            .map(|f| f.md5.clone())
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

/// Spawn the background sweeper. Runs until the token is cancelled.
pub fn spawn_sweeper(
    index: std::sync::Arc<ReplayIndex>,
    period: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let index = index.clone();
                    let result = tokio::task::spawn_blocking(move || index.sweep()).await;
                    match result {
                        Ok(Err(err)) => warn!(%err, "replay sweep failed"),
                        Err(err) => warn!(%err, "replay sweep task failed"),
                        Ok(Ok(())) => {}
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

/// Extract `(start, finish)` from `<prefix>_<start>[_<finish>].<ext>`.
/// `finish` is empty for recordings still missing their stop stamp.
fn parse_recording_name(name: &str) -> Option<(String, String)> {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let parts: Vec<&str> = stem.split('_').collect();
    match parts.as_slice() {
        [_, start] => Some(((*start).to_string(), String::new())),
        [_, start, finish] => Some(((*start).to_string(), (*finish).to_string())),
        _ => None,
    }
}

fn file_md5(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}
