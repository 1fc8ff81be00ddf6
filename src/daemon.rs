//! The sync pass and the loop that drives it. One pass indexes both sides,
//! diffs them against the prior snapshot, runs the four reconciliation
//! phases in order and applies each phase's staged operations. Snapshots
//! are replaced wholesale at the end of the pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::apply::Applier;
use crate::config::Config;
use crate::delta;
use crate::http::DropboxClient;
use crate::index::{self, LocalIndex};
use crate::logging;
use crate::reconcile::reconcile;
use crate::remote::RemoteStore;
use crate::types::{ConflictSkip, Direction, Entry, Index, Op, OpFailure};

/// What one pass staged and what became of it.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub staged: usize,
    pub applied: usize,
    pub conflicts: Vec<ConflictSkip>,
    pub failures: Vec<OpFailure>,
}

pub struct Syncer<S> {
    cfg: Config,
    store: S,
    last_local: Index,
    last_remote: Index,
    cancel: Arc<AtomicBool>,
}

impl<S: RemoteStore> Syncer<S> {
    pub fn new(cfg: Config, store: S) -> Self {
        Syncer {
            cfg,
            store,
            last_local: Index::new(),
            last_remote: Index::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation: checked between applier primitives, so an
    /// in-flight operation always runs to completion.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn last_local(&self) -> &Index {
        &self.last_local
    }

    pub fn last_remote(&self) -> &Index {
        &self.last_remote
    }

    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        std::fs::create_dir_all(&self.cfg.local_folder).with_context(|| {
            format!("create local folder {}", self.cfg.local_folder.display())
        })?;

        let mut local = LocalIndex::build(&self.cfg.local_folder, &self.last_local)?;
        let mut remote = index::remote_index(&self.store, &self.cfg.dropbox_folder).await?;

        let local_delta = delta::diff(local.entries(), &self.last_local);
        let remote_delta = delta::diff(&remote, &self.last_remote);

        let applier = Applier::new(
            &self.store,
            local.root(),
            &self.cfg.dropbox_folder,
            self.cfg.debug,
        );
        let mut report = SyncReport::default();

        let phases = [
            (&local_delta.modified, Op::UploadAdd),
            (&local_delta.removed, Op::UploadDel),
            (&remote_delta.modified, Op::DownloadAdd),
            (&remote_delta.removed, Op::DownloadDel),
        ];
        let mut failure_fixups: Vec<(Op, String, Option<Entry>)> = Vec::new();
        for (changes, op) in phases {
            if self.cancel.load(Ordering::SeqCst) {
                logging::info("sync pass cancelled");
                break;
            }
            let opposite_before: Index = match op.direction() {
                Direction::Up => remote.clone(),
                Direction::Down => local.entries().clone(),
            };
            let staged = reconcile(changes, op, &mut local, &mut remote, &mut report.conflicts);
            report.staged += staged.len();
            let outcome = applier.apply(op, &staged).await;
            // Uploads come back with the server's entry; both indices adopt
            // it, matching the applier's local mtime alignment.
            for entry in outcome.refined {
                if op == Op::UploadAdd {
                    local.insert(entry.clone());
                }
                remote.insert(entry.path.clone(), entry);
            }
            // A failed path must not leave its optimistic mutation behind,
            // or the next pass would mistake the unapplied change for a
            // change made by the other side.
            for failure in &outcome.failed {
                match op.direction() {
                    Direction::Up => match opposite_before.get(&failure.path) {
                        Some(prev) => {
                            remote.insert(failure.path.clone(), prev.clone());
                        }
                        None => {
                            remote.remove(&failure.path);
                        }
                    },
                    Direction::Down => match opposite_before.get(&failure.path) {
                        Some(prev) => local.insert(prev.clone()),
                        None => local.remove(&failure.path),
                    },
                }
                failure_fixups.push((op, failure.path.clone(), changes.get(&failure.path).cloned()));
            }
            report.applied += outcome.completed.len();
            report.conflicts.extend(outcome.skipped);
            report.failures.extend(outcome.failed);
        }

        self.last_local = local.into_entries();
        self.last_remote = remote;

        // Rewind the source-side snapshot for failed paths so the next
        // pass re-derives the same operation from scratch.
        for (op, path, src) in failure_fixups {
            match op {
                Op::UploadAdd => {
                    self.last_local.remove(&path);
                }
                Op::DownloadAdd => {
                    self.last_remote.remove(&path);
                }
                Op::UploadDel => {
                    if let Some(src) = src {
                        self.last_local.insert(path, src);
                    }
                }
                Op::DownloadDel => {
                    if let Some(src) = src {
                        self.last_remote.insert(path, src);
                    }
                }
            }
        }

        logging::info_kv(
            "sync pass complete",
            &[
                ("staged", &report.staged.to_string()),
                ("applied", &report.applied.to_string()),
                ("conflicts", &report.conflicts.len().to_string()),
                ("failures", &report.failures.len().to_string()),
            ],
        );
        Ok(report)
    }

    /// Sync forever at the configured interval. Pass failures are logged
    /// and the loop sleeps until the next interval; only shutdown ends it.
    pub async fn run(&mut self, shutdown: Arc<Notify>) -> Result<()> {
        logging::info_kv(
            "sync loop start",
            &[
                ("local", &self.cfg.local_folder.display().to_string()),
                ("remote", &display_root(&self.cfg.dropbox_folder)),
                ("interval", &self.cfg.interval_seconds.to_string()),
                ("debug", &self.cfg.debug.to_string()),
            ],
        );

        let cancel = self.cancel.clone();
        let watcher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            watcher_shutdown.notified().await;
            cancel.store(true, Ordering::SeqCst);
        });

        loop {
            if let Err(err) = self.sync_once().await {
                logging::error(format!("sync pass failed: {err:#}"));
            }
            if self.cancel.load(Ordering::SeqCst) {
                logging::info("sync loop stop");
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.notified() => {
                    logging::info("sync loop stop");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.interval_seconds)) => {}
            }
        }
    }
}

fn display_root(remote_root: &str) -> String {
    if remote_root.is_empty() {
        "/".to_string()
    } else {
        remote_root.to_string()
    }
}

/// Wire up the HTTP client and run the loop until `shutdown` fires.
pub async fn run_daemon(cfg: Config, shutdown: Arc<Notify>) -> Result<()> {
    let store = DropboxClient::new(&cfg)?;
    let mut syncer = Syncer::new(cfg, store);
    syncer.run(shutdown).await
}
