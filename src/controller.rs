//! Pass controller
//!
//! Runs the first pass over the whole work set, then up to
//! `max_retry_passes` retry passes over whatever has not settled yet. Retry
//! passes use half as many instances, start from clean staging directories,
//! and back off when the previous pass was throttled.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::isolation::{IsolationManager, clean_shared_locks};
use crate::partition::partition;
use crate::reconcile::Reconciler;
use crate::report::{DiscrepancyRecord, FailedItem, RunSummary};
use crate::retry::{jittered_backoff, sleep_or_cancel};
use crate::store::ResultStore;
use crate::tool::InstanceRunner;
use crate::types::{Event, ItemId, Signals};
use crate::worker::{WorkerContext, WorkerJob, WorkerState, run_worker};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What one pass produced besides the outcomes in the store
#[derive(Debug, Default)]
struct PassOutcome {
    signals: Signals,
    rate_limited: bool,
    discrepancies: Vec<ItemId>,
    slots: usize,
}

/// Drives passes of concurrent tool instances over a list of items
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> workshop_dl::Result<()> {
/// use std::sync::Arc;
/// use workshop_dl::{CliInstanceRunner, Config, PassController};
///
/// let config = Config::default();
/// let runner = Arc::new(CliInstanceRunner::from_config(&config.tool)?);
/// let controller = PassController::new(config, runner)?;
///
/// let ids = workshop_dl::load_identifiers("ImportedSkins.json".as_ref()).await?;
/// let summary = controller.run(&ids, &[]).await?;
/// println!("{} downloaded, {} failed", summary.counts.success, summary.failed.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PassController {
    config: Arc<Config>,
    ctx: Arc<WorkerContext>,
}

impl PassController {
    /// Create a controller; the configuration is validated first
    pub fn new(config: Config, runner: Arc<dyn InstanceRunner>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let isolation = IsolationManager::new(&config);
        let reconciler = Reconciler::new(
            isolation.clone(),
            &config.layout.shared_root,
            &config.tool.app_id,
        );
        // subscribers that fall behind lose old events, never block workers
        let (event_tx, _rx) = broadcast::channel(1000);

        let ctx = WorkerContext {
            config: config.clone(),
            isolation,
            reconciler,
            store: Arc::new(ResultStore::new()),
            runner,
            event_tx,
            cancel: CancellationToken::new(),
        };
        Ok(Self {
            config,
            ctx: Arc::new(ctx),
        })
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.event_tx.subscribe()
    }

    /// Shared result store
    pub fn store(&self) -> &Arc<ResultStore> {
        &self.ctx.store
    }

    /// Token that stops the run: no new pass starts and running instances are killed
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: Event) {
        self.ctx.event_tx.send(event).ok();
    }

    /// Apply the pre-dispatch policies and return the items to download
    ///
    /// Items excluded by `only_previously_failed` or already present in the
    /// shared destination (with `skip_existing`) are marked `Skipped`.
    pub async fn prepare_work(
        &self,
        all_ids: &[ItemId],
        previously_failed: &[ItemId],
    ) -> Vec<ItemId> {
        let run = &self.config.run;
        let only_failed = run.only_previously_failed && !previously_failed.is_empty();
        if run.only_previously_failed && previously_failed.is_empty() {
            warn!("no previously failed IDs recorded, dispatching every item");
        }
        let failed: HashSet<&ItemId> = previously_failed.iter().collect();
        let candidates: Vec<ItemId> = all_ids
            .iter()
            .filter(|id| !only_failed || failed.contains(id))
            .cloned()
            .collect();
        let present = if run.skip_existing {
            self.present_items(candidates.clone()).await
        } else {
            HashSet::new()
        };

        let mut work = Vec::with_capacity(candidates.len());
        for id in all_ids {
            if (only_failed && !failed.contains(id)) || present.contains(id) {
                self.ctx.store.mark_skipped(id);
            } else {
                work.push(id.clone());
            }
        }
        work
    }

    /// Items of `ids` already in the shared destination
    async fn present_items(&self, ids: Vec<ItemId>) -> HashSet<ItemId> {
        let reconciler = self.ctx.reconciler.clone();
        let present = tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .filter(|id| reconciler.is_present(id))
                .collect::<HashSet<_>>()
        })
        .await;
        present.unwrap_or_else(|e| {
            warn!(error = %e, "presence check failed, dispatching every item");
            HashSet::new()
        })
    }

    async fn prepare_dirs(&self) -> Result<()> {
        let layout = &self.config.layout;
        tokio::fs::create_dir_all(self.ctx.reconciler.shared_content()).await?;
        tokio::fs::create_dir_all(&layout.instances_root).await?;
        tokio::fs::create_dir_all(&layout.log_dir).await?;
        tokio::fs::create_dir_all(&layout.script_dir).await?;
        Ok(())
    }

    /// Download every item, retrying failures across passes
    ///
    /// Exhausting the retry passes is not an error; check
    /// [`RunSummary::has_failures`].
    ///
    /// # Errors
    ///
    /// Fails if `all_ids` is empty, if the working directories cannot be
    /// created, or with [`Error::Cancelled`] if the run was cancelled before
    /// it started.
    pub async fn run(&self, all_ids: &[ItemId], previously_failed: &[ItemId]) -> Result<RunSummary> {
        if all_ids.is_empty() {
            return Err(Error::config("ids", "the item source contains no workshop IDs"));
        }
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.prepare_dirs().await?;

        let started_at = Utc::now();
        let started = Instant::now();
        let work = self.prepare_work(all_ids, previously_failed).await;
        for id in &work {
            self.ctx.store.mark_pending(id);
        }
        info!(
            total = all_ids.len(),
            dispatched = work.len(),
            skipped = all_ids.len() - work.len(),
            instances = self.config.run.max_instances,
            "run starting"
        );

        let total_passes = self.config.total_passes();
        let mut pending = work.clone();
        let mut pass = 0u32;
        let mut slots_used = 0usize;
        let mut throttled = false;
        let mut discrepancies = Vec::new();
        let mut cancelled = false;

        while !pending.is_empty() && pass < total_passes {
            if self.ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let instances = if pass == 0 {
                self.config.run.max_instances
            } else {
                let retry = pass;
                info!(
                    retry,
                    max_retries = self.config.run.max_retry_passes,
                    items = pending.len(),
                    "starting retry pass"
                );
                self.ctx.isolation.reset_all(slots_used).await;
                if throttled && !self.backoff(retry).await {
                    cancelled = true;
                    break;
                }
                for id in &pending {
                    self.ctx.store.mark_retrying(id);
                }
                self.config.retry_instances()
            };
            clean_shared_locks(&self.config.layout.shared_root).await;

            pass += 1;
            let outcome = self.run_pass(pass, &pending, instances).await;
            slots_used = slots_used.max(outcome.slots);
            throttled = outcome.rate_limited;
            discrepancies.extend(
                outcome
                    .discrepancies
                    .into_iter()
                    .map(|id| DiscrepancyRecord { id, pass }),
            );

            pending = self.ctx.store.retry_set(&pending);
            debug_assert!(self.ctx.store.counters_consistent());
            self.emit(Event::PassFinished {
                pass,
                remaining: pending.len(),
                signals: outcome.signals,
            });
            info!(
                pass,
                remaining = pending.len(),
                rate_limited = outcome.signals.rate_limited,
                lock_contended = outcome.signals.lock_contended,
                "pass finished"
            );
        }
        if !cancelled && self.ctx.cancel.is_cancelled() {
            cancelled = true;
        }

        let counts = self.ctx.store.counts();
        let failed = self
            .ctx
            .store
            .outcomes_for(&work)
            .into_iter()
            .filter(|(_, outcome)| !outcome.is_settled())
            .map(|(id, outcome)| FailedItem { id, outcome })
            .collect();
        self.emit(Event::RunFinished {
            counts,
            passes: pass,
        });

        Ok(RunSummary {
            started_at,
            total_ids: all_ids.len(),
            dispatched: work.len(),
            counts,
            failed,
            discrepancies,
            passes: pass,
            elapsed_secs: started.elapsed().as_secs(),
            cancelled,
        })
    }

    /// Sleep before retry pass `retry`; returns `false` if cancelled meanwhile
    async fn backoff(&self, retry: u32) -> bool {
        let delay = jittered_backoff(&self.config.retry, retry);
        warn!(
            retry,
            delay_secs = delay.as_secs(),
            "rate limit detected, backing off before retry"
        );
        self.emit(Event::RateLimitBackoff { delay });
        sleep_or_cancel(delay, &self.ctx.cancel).await
    }

    /// Dispatch one pass and wait for every worker to finish
    async fn run_pass(&self, pass: u32, items: &[ItemId], instances: usize) -> PassOutcome {
        let chunks = partition(items, instances);
        self.emit(Event::PassStarted {
            pass,
            total_passes: self.config.total_passes(),
            items: items.len(),
            instances: chunks.len(),
        });
        info!(pass, items = items.len(), instances = chunks.len(), "pass starting");

        let rate_limited = Arc::new(AtomicBool::new(false));
        let reporter_cancel = CancellationToken::new();
        let reporter = self.spawn_progress_reporter(pass, items.len(), reporter_cancel.clone());

        let slots = chunks.len();
        let handles: Vec<_> = chunks
            .into_iter()
            .enumerate()
            .map(|(slot, chunk)| {
                tokio::spawn(run_worker(
                    self.ctx.clone(),
                    WorkerJob {
                        pass,
                        slot,
                        items: chunk,
                        rate_limited: rate_limited.clone(),
                    },
                ))
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        reporter_cancel.cancel();
        if let Err(e) = reporter.await {
            warn!(pass, error = %e, "progress reporter task failed");
        }

        let mut outcome = PassOutcome {
            slots,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(report) => {
                    outcome.signals.merge(report.signals);
                    outcome.discrepancies.extend(report.discrepancies);
                    if report.state == WorkerState::Abandoned {
                        warn!(pass, slot = report.slot, "slot abandoned its chunk");
                    }
                }
                // the chunk's items stay Unknown and are retried
                Err(e) => error!(pass, error = %e, "worker task panicked"),
            }
        }
        outcome.rate_limited = rate_limited.load(Ordering::Acquire);
        outcome
    }

    /// Spawn a task that emits a `Progress` event every poll interval
    fn spawn_progress_reporter(
        &self,
        pass: u32,
        total: usize,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.ctx.store.clone();
        let event_tx = self.ctx.event_tx.clone();
        let period = self.config.run.poll_interval.max(Duration::from_millis(10));

        // items settled before this pass are not part of its progress
        let baseline = store.counts().total();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let counts = store.counts();
                        event_tx
                            .send(Event::Progress {
                                pass,
                                processed: counts.total().saturating_sub(baseline),
                                total,
                                counts,
                            })
                            .ok();
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
        })
    }
}
