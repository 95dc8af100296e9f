//! Bounded-concurrency fetch executor.
//!
//! Each request walks an explicit state machine:
//!
//! ```text
//! pending -> in_flight -> success
//!                      -> retrying -> in_flight ...
//!                      -> failed_permanent
//!                      -> failed_retryable_exhausted
//! ```
//!
//! Workers share nothing but an atomic dispatch cursor and the outcome list.
//! Every archive lands on its own path, so file writes need no locking.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{CollectionId, RequestKey};
use crate::error::HarvestError;
use crate::fs_util;
use crate::manifest::FetchRequest;
use crate::source::{ImagerySource, SourceError};
use crate::store::{self, OutputLayout, RunMetadata};

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the `retry`-th retry (1-based), never shorter
    /// than a server-provided hint and never longer than `max_delay`.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);
        exponential.max(hint.unwrap_or_default()).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub skip_existing: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 30,
            retry: RetryPolicy::default(),
            skip_existing: true,
        }
    }
}

/// Cooperative stop signal: no new requests are dispatched once set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStatus {
    Success,
    SkippedExisting,
    FailedPermanent,
    FailedRetryableExhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub key: RequestKey,
    pub collection: CollectionId,
    pub status: FetchStatus,
    pub output_path: Option<Utf8PathBuf>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    fn cancelled(request: &FetchRequest) -> Self {
        Self {
            key: request.key.clone(),
            collection: request.collection.clone(),
            status: FetchStatus::Cancelled,
            output_path: None,
            attempts: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub total: usize,
    pub success: usize,
    pub skipped_existing: usize,
    pub failed_permanent: usize,
    pub failed_retryable_exhausted: usize,
    pub cancelled: usize,
}

impl FetchSummary {
    pub fn from_outcomes(outcomes: &[FetchOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                FetchStatus::Success => summary.success += 1,
                FetchStatus::SkippedExisting => summary.skipped_existing += 1,
                FetchStatus::FailedPermanent => summary.failed_permanent += 1,
                FetchStatus::FailedRetryableExhausted => summary.failed_retryable_exhausted += 1,
                FetchStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn failed(&self) -> usize {
        self.failed_permanent + self.failed_retryable_exhausted
    }
}

#[derive(Debug)]
enum RequestState {
    Pending,
    InFlight { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32, path: Utf8PathBuf },
    FailedPermanent { attempts: u32, error: String },
    FailedRetryableExhausted { attempts: u32, error: String },
    Cancelled { attempts: u32 },
}

pub struct FetchExecutor<'a, S: ImagerySource> {
    source: &'a S,
    layout: OutputLayout,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl<'a, S: ImagerySource> FetchExecutor<'a, S> {
    pub fn new(
        source: &'a S,
        layout: OutputLayout,
        options: ExecutorOptions,
        cancel: CancellationToken,
    ) -> Result<Self, HarvestError> {
        if options.concurrency == 0 {
            return Err(HarvestError::InvalidInput(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            source,
            layout,
            options,
            cancel,
        })
    }

    /// Runs every request once and returns outcomes sorted by request key.
    pub fn execute(&self, requests: &[FetchRequest]) -> Result<Vec<FetchOutcome>, HarvestError> {
        self.prepare_collections(requests)?;

        let started = Instant::now();
        let workers = self.options.concurrency.min(requests.len()).max(1);
        info!(requests = requests.len(), workers, "fetch started");

        let cursor = AtomicUsize::new(0);
        let finished = Mutex::new(Vec::<(usize, FetchOutcome)>::with_capacity(requests.len()));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(request) = requests.get(index) else {
                            break;
                        };
                        let outcome = self.run_request(request);
                        finished
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push((index, outcome));
                    }
                });
            }
        });

        let finished = finished
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut by_index: BTreeMap<usize, FetchOutcome> = finished.into_iter().collect();
        let mut outcomes: Vec<(usize, FetchOutcome)> = requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let outcome = by_index
                    .remove(&index)
                    .unwrap_or_else(|| FetchOutcome::cancelled(request));
                (index, outcome)
            })
            .collect();
        outcomes.sort_by(|(ia, a), (ib, b)| a.key.cmp(&b.key).then(ia.cmp(ib)));
        let outcomes: Vec<FetchOutcome> = outcomes.into_iter().map(|(_, outcome)| outcome).collect();

        let summary = FetchSummary::from_outcomes(&outcomes);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = summary.success,
            skipped = summary.skipped_existing,
            failed_permanent = summary.failed_permanent,
            failed_exhausted = summary.failed_retryable_exhausted,
            cancelled = summary.cancelled,
            "fetch finished"
        );
        Ok(outcomes)
    }

    fn prepare_collections(&self, requests: &[FetchRequest]) -> Result<(), HarvestError> {
        let mut seen = BTreeMap::<String, (&FetchRequest, usize)>::new();
        for request in requests {
            seen.entry(request.collection.as_str().to_string())
                .and_modify(|(_, count)| *count += 1)
                .or_insert((request, 1));
        }
        for (request, count) in seen.into_values() {
            self.layout.ensure_collection_dir(&request.collection)?;
            let metadata = RunMetadata {
                collection: request.collection.to_string(),
                channels: request.channels.clone(),
                precision: request.tile.geohash.precision(),
                requests: count,
                fetched_at: chrono::Utc::now().to_rfc3339(),
                tool: format!("geoharvest/{}", env!("CARGO_PKG_VERSION")),
            };
            store::write_metadata(&self.layout.metadata_path(&request.collection), &metadata)?;
        }
        Ok(())
    }

    fn run_request(&self, request: &FetchRequest) -> FetchOutcome {
        let output = self.layout.archive_path(&request.collection, &request.key);
        if self.options.skip_existing && self.layout.has_archive(&request.collection, &request.key)
        {
            debug!(key = %request.key, "already fetched, skipping");
            return FetchOutcome {
                key: request.key.clone(),
                collection: request.collection.clone(),
                status: FetchStatus::SkippedExisting,
                output_path: Some(output),
                attempts: 0,
                error: None,
            };
        }

        let mut state = RequestState::Pending;
        loop {
            state = match state {
                RequestState::Pending => RequestState::InFlight { attempt: 1 },
                RequestState::InFlight { attempt } => {
                    match self.fetch_archive(request) {
                        Ok(bytes) => match store::write_bytes_atomic(output.as_std_path(), &bytes) {
                            Ok(()) => RequestState::Succeeded {
                                attempts: attempt,
                                path: output.clone(),
                            },
                            Err(err) => RequestState::FailedPermanent {
                                attempts: attempt,
                                error: err.to_string(),
                            },
                        },
                        Err(err) => self.after_failure(request, attempt, err),
                    }
                }
                RequestState::Retrying { attempt, delay } => {
                    if sleep_unless_cancelled(delay, &self.cancel) {
                        RequestState::InFlight {
                            attempt: attempt + 1,
                        }
                    } else {
                        RequestState::Cancelled { attempts: attempt }
                    }
                }
                RequestState::Succeeded { attempts, path } => {
                    debug!(key = %request.key, attempts, "fetched");
                    return FetchOutcome {
                        key: request.key.clone(),
                        collection: request.collection.clone(),
                        status: FetchStatus::Success,
                        output_path: Some(path),
                        attempts,
                        error: None,
                    };
                }
                RequestState::FailedPermanent { attempts, error } => {
                    warn!(key = %request.key, attempts, error = %error, "request failed permanently");
                    return FetchOutcome {
                        key: request.key.clone(),
                        collection: request.collection.clone(),
                        status: FetchStatus::FailedPermanent,
                        output_path: None,
                        attempts,
                        error: Some(error),
                    };
                }
                RequestState::Cancelled { attempts } => {
                    debug!(key = %request.key, attempts, "cancelled during backoff");
                    return FetchOutcome {
                        attempts,
                        ..FetchOutcome::cancelled(request)
                    };
                }
                RequestState::FailedRetryableExhausted { attempts, error } => {
                    warn!(key = %request.key, attempts, error = %error, "retries exhausted");
                    return FetchOutcome {
                        key: request.key.clone(),
                        collection: request.collection.clone(),
                        status: FetchStatus::FailedRetryableExhausted,
                        output_path: None,
                        attempts,
                        error: Some(error),
                    };
                }
            };
        }
    }

    /// A body that is not a readable zip is never written under the key's path.
    fn fetch_archive(&self, request: &FetchRequest) -> Result<Vec<u8>, SourceError> {
        let bytes = self.source.fetch_tile(
            &request.tile.bbox,
            &request.window,
            &request.collection,
            &request.channels,
        )?;
        fs_util::validate_zip(&bytes).map_err(|err| SourceError::Malformed(err.to_string()))?;
        Ok(bytes)
    }

    fn after_failure(&self, request: &FetchRequest, attempt: u32, err: SourceError) -> RequestState {
        let policy = self.options.retry;
        if !err.is_transient() {
            return RequestState::FailedPermanent {
                attempts: attempt,
                error: err.to_string(),
            };
        }
        if attempt > policy.max_retries {
            return RequestState::FailedRetryableExhausted {
                attempts: attempt,
                error: err.to_string(),
            };
        }
        let delay = policy.delay_for(attempt, err.retry_after());
        warn!(
            key = %request.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );
        RequestState::Retrying { attempt, delay }
    }
}

/// Convenience wrapper: one executor run against `output_dir`.
pub fn execute<S: ImagerySource>(
    source: &S,
    requests: &[FetchRequest],
    options: ExecutorOptions,
    output_dir: &Path,
    cancel: CancellationToken,
) -> Result<Vec<FetchOutcome>, HarvestError> {
    let layout = OutputLayout::from_path(output_dir)?;
    FetchExecutor::new(source, layout, options, cancel)?.execute(requests)
}

/// Sleeps for `delay`; returns `false` if cancellation was observed first.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}
