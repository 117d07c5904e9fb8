//! Append-only disk spool for undeliverable batches.
//!
//! When the network stays unhealthy, batches are written as JSONL (one line
//! per batch, each line a JSON array of events) to a file under the system
//! temp directory. The size check and the append use the same file
//! descriptor, so a concurrent writer cannot slip between the check and the
//! write. Whole lines are written with a single `write_all` under
//! `O_APPEND`, which POSIX keeps atomic per write, so readers only ever see
//! complete lines.
//!
//! Startup recovery renames the spool to a `.recovering` sibling and loads
//! it into the buffer; the sibling is deleted only after the first
//! successful flush acknowledges that at least one batch made it out. A
//! plain delete at load time would lose the events if the process crashed
//! before flushing.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::buffer::EventBuffer;
use crate::event::RequestEvent;

#[derive(Debug)]
pub(crate) struct Spool {
    path: PathBuf,
    max_bytes: u64,
    debug_enabled: bool,
}

impl Spool {
    pub(crate) fn new(path: PathBuf, max_bytes: u64, debug_enabled: bool) -> Self {
        Spool {
            path,
            max_bytes,
            debug_enabled,
        }
    }

    /// Default spool location: a temp-directory file keyed by a short hash
    /// of the endpoint, so clients pointed at different endpoints never
    /// share a file.
    pub(crate) fn default_path(endpoint: &str) -> PathBuf {
        let digest = Sha256::digest(endpoint.as_bytes());
        let hash8: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        std::env::temp_dir().join(format!("apipulse-{hash8}.spool"))
    }

    fn recovering_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".recovering");
        PathBuf::from(name)
    }

    /// Appends one batch as a single JSONL line. Failures are swallowed:
    /// disk loss is the accepted last resort.
    pub(crate) async fn write(&self, batch: &[RequestEvent]) {
        let Some(line) = encode_line(batch) else {
            if self.debug_enabled {
                debug!("failed to encode batch for spooling, dropped");
            }
            return;
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        options.mode(0o600);

        let result = async {
            let mut file = options.open(&self.path).await?;
            // fstat on the open descriptor, not a fresh stat on the path
            if file.metadata().await?.len() >= self.max_bytes {
                return Ok::<bool, std::io::Error>(false);
            }
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(true)
        }
        .await;

        self.log_write_result(result, batch.len());
    }

    /// Synchronous variant of [`Spool::write`] for shutdown paths where no
    /// async work can be awaited.
    pub(crate) fn write_sync(&self, batch: &[RequestEvent]) {
        let Some(line) = encode_line(batch) else {
            if self.debug_enabled {
                debug!("failed to encode batch for spooling, dropped");
            }
            return;
        };

        let mut options = std::fs::OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);

        let result = (|| {
            let mut file = options.open(&self.path)?;
            if file.metadata()?.len() >= self.max_bytes {
                return Ok::<bool, std::io::Error>(false);
            }
            file.write_all(&line)?;
            file.flush()?;
            Ok(true)
        })();

        self.log_write_result(result, batch.len());
    }

    fn log_write_result(&self, result: std::io::Result<bool>, batch_len: usize) {
        match result {
            Ok(true) => {
                if self.debug_enabled {
                    debug!(events = batch_len, path = %self.path.display(), "batch spooled to disk");
                }
            }
            Ok(false) => {
                if self.debug_enabled {
                    debug!(
                        cap = self.max_bytes,
                        "spool file at size cap, batch dropped"
                    );
                }
            }
            Err(err) => {
                if self.debug_enabled {
                    debug!(error = %err, path = %self.path.display(), "spool write failed, batch dropped");
                }
            }
        }
    }

    /// Loads previously spooled events into `buffer` on startup.
    ///
    /// A leftover `.recovering` sibling (crash during a previous recovery)
    /// takes priority over the primary file. After loading from the primary
    /// it is renamed to the sibling; the caller records the returned path
    /// and deletes it on the first successful flush. Corrupt lines are
    /// skipped; a file that cannot be read at all is deleted.
    pub(crate) fn recover(&self, buffer: &mut EventBuffer) -> Option<PathBuf> {
        let recovering = self.recovering_path();
        let (source, rename_after_load) = if recovering.exists() {
            (recovering.clone(), false)
        } else if self.path.exists() {
            (self.path.clone(), true)
        } else {
            return None;
        };

        let contents = match std::fs::read_to_string(&source) {
            Ok(contents) => contents,
            Err(err) => {
                if self.debug_enabled {
                    debug!(error = %err, path = %source.display(), "unreadable spool file, deleting");
                }
                let _ = std::fs::remove_file(&source);
                return None;
            }
        };

        let mut loaded = 0usize;
        let mut at_capacity = false;
        'lines: for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(batch) = serde_json::from_str::<Vec<RequestEvent>>(line) else {
                continue;
            };
            for event in batch {
                if !buffer.append(event) {
                    at_capacity = true;
                    break 'lines;
                }
                loaded += 1;
            }
        }

        if rename_after_load && std::fs::rename(&self.path, &recovering).is_err() {
            // cannot mark the file as in-recovery; remove it so the same
            // events are not replayed again on the next start
            let _ = std::fs::remove_file(&self.path);
        }

        if self.debug_enabled {
            debug!(
                events = loaded,
                truncated = at_capacity,
                "recovered spooled events into buffer"
            );
        }
        Some(recovering)
    }

    /// Deletes the recovery file once a post-startup flush has succeeded.
    pub(crate) fn cleanup_recovery(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

fn encode_line(batch: &[RequestEvent]) -> Option<Vec<u8>> {
    let mut line = serde_json::to_vec(batch).ok()?;
    line.push(b'\n');
    Some(line)
}
