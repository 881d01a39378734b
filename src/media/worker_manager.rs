#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::config::WorkerConfig;
use crate::media::types::{EngineFault, MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerId, WorkerLogLevel, WorkerLogTag};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

/// Manages a pool of mediasoup Workers
pub struct WorkerManager {
    workers: RwLock<Vec<Worker>>,
    router_counts: HashMap<WorkerId, Arc<AtomicUsize>>,
    faults: broadcast::Sender<EngineFault>,
    // keeps the worker threads' executor alive
    _mediasoup_worker_manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerManager {
    /// Starts `num_workers` workers. A worker that later dies is reported on `faults`.
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn new(
        config: &WorkerConfig,
        faults: broadcast::Sender<EngineFault>,
    ) -> MediaResult<Self> {
        info!("Creating WorkerManager with {} workers", config.num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(config.num_workers);
        let mut router_counts = HashMap::new();

        for i in 0..config.num_workers {
            let worker = manager
                .create_worker(worker_settings(config))
                .await
                .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
            let worker_id = worker.id();
            info!("Created worker {} with id: {}", i, worker_id);

            Self::setup_worker_handlers(&worker, i, faults.clone());

            router_counts.insert(worker_id, Arc::new(AtomicUsize::new(0)));
            workers.push(worker);
        }

        Ok(Self {
            workers: RwLock::new(workers),
            router_counts,
            faults,
            _mediasoup_worker_manager: manager,
        })
    }

    fn setup_worker_handlers(worker: &Worker, worker_index: usize, faults: broadcast::Sender<EngineFault>) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, worker_index, reason);
                let _ = faults.send(EngineFault {
                    worker_id: worker_id.to_string(),
                    reason: format!("{reason:?}"),
                });
            })
            .detach();
    }

    /// Gets the worker hosting the fewest routers, along with its router counter.
    /// The caller increments the counter once its router exists.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if no live worker is available
    pub async fn get_least_loaded_worker(&self) -> MediaResult<(Worker, Arc<AtomicUsize>)> {
        let workers = self.workers.read().await;

        let best = workers
            .iter()
            .filter(|w| !w.closed())
            .filter_map(|w| self.router_counts.get(&w.id()).map(|c| (w, c)))
            .min_by_key(|(_, count)| count.load(Ordering::Relaxed));

        match best {
            Some((worker, count)) => {
                debug!(
                    "Selected worker {} ({} routers)",
                    worker.id(),
                    count.load(Ordering::Relaxed)
                );
                Ok((worker.clone(), count.clone()))
            }
            None => Err(MediaError::WorkerError("No workers available".to_string())),
        }
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<EngineFault> {
        self.faults.subscribe()
    }
}

/// Maps the configured settings onto mediasoup's worker settings
fn worker_settings(config: &WorkerConfig) -> WorkerSettings {
    let mut settings = WorkerSettings::default();
    settings.log_level = parse_log_level(&config.log_level);
    settings.log_tags = vec![
        WorkerLogTag::Info,
        WorkerLogTag::Ice,
        WorkerLogTag::Dtls,
        WorkerLogTag::Rtp,
        WorkerLogTag::Rtcp,
    ];
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;
    settings
}

fn parse_log_level(level: &str) -> WorkerLogLevel {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => WorkerLogLevel::Debug,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Warn,
    }
}
