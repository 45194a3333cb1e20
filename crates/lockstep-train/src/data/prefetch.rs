//! Background shard loading, one shard ahead of training.
//!
//! A single worker thread decodes the next shard while the coordinator trains
//! on the current one. At most one request is outstanding; `wait` blocks
//! until the requested shard is decoded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use super::dataset::ShardDataset;
use crate::error::{JobError, JobResult};

/// Decodes one shard file. Must be safe to call from the worker thread.
pub type ShardLoader = Arc<dyn Fn(&Path) -> JobResult<ShardDataset> + Send + Sync>;

/// Loader for the flat u32 token format.
pub fn token_file_loader(seq_len: usize) -> ShardLoader {
    Arc::new(move |path: &Path| ShardDataset::from_binary_file(path, seq_len))
}

/// Handle for one outstanding load, redeemed with [`ShardPrefetcher::wait`].
#[derive(Debug)]
#[must_use = "a prefetch ticket must be waited on or cancelled"]
pub struct PrefetchTicket {
    id: u64,
    path: PathBuf,
}

impl PrefetchTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct LoadRequest {
    id: u64,
    path: PathBuf,
}

struct LoadResult {
    id: u64,
    result: JobResult<ShardDataset>,
}

pub struct ShardPrefetcher {
    request_tx: Option<Sender<LoadRequest>>,
    result_rx: Option<Receiver<LoadResult>>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    shards_loaded: Arc<AtomicUsize>,
    next_id: u64,
    outstanding: Option<(u64, PathBuf)>,
}

impl ShardPrefetcher {
    pub fn new(loader: ShardLoader) -> JobResult<Self> {
        let (request_tx, request_rx) = bounded::<LoadRequest>(1);
        let (result_tx, result_rx) = bounded::<LoadResult>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shards_loaded = Arc::new(AtomicUsize::new(0));

        let worker = {
            let shutdown = Arc::clone(&shutdown);
            let shards_loaded = Arc::clone(&shards_loaded);
            thread::Builder::new()
                .name("shard-prefetch".to_string())
                .spawn(move || {
                    for request in request_rx {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = loader(&request.path);
                        if result.is_ok() {
                            shards_loaded.fetch_add(1, Ordering::Relaxed);
                        }
                        let sent = result_tx.send(LoadResult {
                            id: request.id,
                            result,
                        });
                        if sent.is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| JobError::WorkerPanic(format!("failed to spawn prefetch worker: {}", e)))?
        };

        Ok(Self {
            request_tx: Some(request_tx),
            result_rx: Some(result_rx),
            worker: Some(worker),
            shutdown,
            shards_loaded,
            next_id: 0,
            outstanding: None,
        })
    }

    /// Start loading `path` in the background.
    pub fn submit(&mut self, path: &Path) -> JobResult<PrefetchTicket> {
        if let Some((_, pending)) = &self.outstanding {
            return Err(JobError::PrefetchBusy {
                pending: pending.display().to_string(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;

        let tx = self.request_tx.as_ref().ok_or_else(worker_gone)?;
        tx.send(LoadRequest {
            id,
            path: path.to_path_buf(),
        })
        .map_err(|_| worker_gone())?;

        self.outstanding = Some((id, path.to_path_buf()));
        Ok(PrefetchTicket {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Block until the ticket's shard is decoded.
    ///
    /// A decode failure is returned as-is; there is no retry.
    pub fn wait(&mut self, ticket: PrefetchTicket) -> JobResult<ShardDataset> {
        match &self.outstanding {
            Some((id, _)) if *id == ticket.id => {}
            _ => {
                return Err(JobError::WorkerPanic(format!(
                    "ticket for {} is not outstanding",
                    ticket.path.display()
                )))
            }
        }
        self.outstanding = None;

        let rx = self.result_rx.as_ref().ok_or_else(worker_gone)?;
        loop {
            let response = rx.recv().map_err(|_| worker_gone())?;
            // Results of cancelled requests are dropped here.
            if response.id == ticket.id {
                return response.result;
            }
        }
    }

    /// Abandon an outstanding load. Its result is discarded when it arrives.
    pub fn cancel(&mut self, ticket: PrefetchTicket) {
        if matches!(&self.outstanding, Some((id, _)) if *id == ticket.id) {
            self.outstanding = None;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Number of shards decoded successfully so far.
    pub fn shards_loaded(&self) -> usize {
        self.shards_loaded.load(Ordering::Relaxed)
    }
}

fn worker_gone() -> JobError {
    JobError::WorkerPanic("prefetch worker exited".to_string())
}

impl Drop for ShardPrefetcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Closing both channels unblocks the worker whether it is waiting
        // for a request or trying to deliver a result.
        self.request_tx.take();
        self.result_rx.take();

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
