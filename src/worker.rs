//! Instance worker: one tool instance over one chunk in one slot
//!
//! ```text
//! Starting -> Running -> Completed   -> Reconciled
//!                     -> HardTimeout -> Reconciled
//!                     -> Cancelled
//! Starting | Running  -> Abandoned
//! ```
//!
//! A worker never fails: everything that goes wrong ends up either as
//! per-item outcomes in the store or as an abandoned chunk whose items stay
//! `Unknown` for the next pass.

use crate::classifier::{ClassifiedLog, classify_log_file};
use crate::config::Config;
use crate::error::Result;
use crate::isolation::IsolationManager;
use crate::reconcile::{ItemDecision, Reconciler, folder_has_files, move_item};
use crate::store::ResultStore;
use crate::tool::script::{remove_script, render_script, write_script};
use crate::tool::{InstanceRunner, Invocation, ProcessExit};
use crate::types::{Event, ItemId, Outcome, Signals};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Preparing the slot and writing the script
    Starting,
    /// The tool instance is running
    Running,
    /// The instance exited on its own
    Completed,
    /// The instance was killed after exceeding its budget
    HardTimeout,
    /// The run was cancelled while the instance was running
    Cancelled,
    /// Every chunk item received its final outcome
    Reconciled,
    /// The chunk could not be started; its items stay pending
    Abandoned,
}

/// Shared, read-only dependencies of every worker in a run
pub struct WorkerContext {
    /// Run configuration
    pub config: Arc<Config>,
    /// Slot directory manager
    pub isolation: IsolationManager,
    /// Moves results into the shared destination
    pub reconciler: Reconciler,
    /// Shared result store
    pub store: Arc<ResultStore>,
    /// Launches tool instances
    pub runner: Arc<dyn InstanceRunner>,
    /// Event channel
    pub event_tx: broadcast::Sender<Event>,
    /// Run-wide cancellation
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("isolation", &self.isolation)
            .field("runner", &self.runner.name())
            .finish_non_exhaustive()
    }
}

/// One chunk assigned to one slot in one pass
#[derive(Debug, Clone)]
pub struct WorkerJob {
    /// Pass number, starting at 1
    pub pass: u32,
    /// Slot index
    pub slot: usize,
    /// Items to download, in dispatch order
    pub items: Vec<ItemId>,
    /// Raised by any worker of the pass that saw throttling
    pub rate_limited: Arc<AtomicBool>,
}

/// What a worker did, returned to the pass controller
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Slot index
    pub slot: usize,
    /// Terminal state
    pub state: WorkerState,
    /// Signals raised by the instance, including the enforced timeout
    pub signals: Signals,
    /// Items the tool claimed but that never materialized
    pub discrepancies: Vec<ItemId>,
}

impl WorkerContext {
    fn emit(&self, event: Event) {
        // no subscribers is fine
        self.event_tx.send(event).ok();
    }

    fn log_path(&self, pass: u32, slot: usize) -> PathBuf {
        self.config.layout.log_dir.join(log_file_name(pass, slot))
    }

    fn script_path(&self, slot: usize) -> PathBuf {
        self.config
            .layout
            .script_dir
            .join(format!("t{slot}"))
            .join("script.txt")
    }

    /// Instance budget: the per-item timeout times the chunk size
    pub fn budget(&self, items: usize) -> Duration {
        let items = u32::try_from(items).unwrap_or(u32::MAX);
        self.config.run.base_timeout_per_item.saturating_mul(items)
    }

    /// Starting: slot directory, clean staging, script on disk
    async fn prepare(&self, pass: u32, slot: usize, items: &[ItemId]) -> Result<Invocation> {
        let install_root = std::path::absolute(self.isolation.acquire(slot).await?)?;
        self.isolation.reset_staging(slot).await;

        let log_path = std::path::absolute(self.log_path(pass, slot))?;
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let script_path = std::path::absolute(self.script_path(slot))?;
        let script = render_script(
            &self.config.tool.login,
            &install_root,
            &self.config.tool.app_id,
            items,
        );
        write_script(&script_path, &script, slot).await?;

        Ok(Invocation {
            slot,
            pass,
            install_root,
            script_path,
            log_path,
            timeout: self.budget(items.len()),
            cancel: self.cancel.child_token(),
        })
    }

    async fn abandon(
        &self,
        pass: u32,
        slot: usize,
        items: &[ItemId],
        reason: String,
    ) -> WorkerReport {
        error!(
            pass,
            slot,
            items = items.len(),
            error = %reason,
            "chunk abandoned, items stay pending for the next pass"
        );
        self.emit(Event::ChunkAbandoned {
            pass,
            slot,
            items: items.len(),
            error: reason,
        });
        self.isolation.reset_staging(slot).await;
        WorkerReport {
            slot,
            state: WorkerState::Abandoned,
            signals: Signals::default(),
            discrepancies: Vec::new(),
        }
    }

    /// Reconcile after a natural exit or hard timeout
    async fn reconcile(
        &self,
        pass: u32,
        slot: usize,
        classified: &ClassifiedLog,
        items: &[ItemId],
        hard_timeout: bool,
    ) -> Vec<ItemDecision> {
        let pairs: Vec<(ItemId, Outcome)> = items
            .iter()
            .map(|id| (id.clone(), classified.outcome(id)))
            .collect();
        let reconciler = self.reconciler.clone();
        let decisions = tokio::task::spawn_blocking(move || {
            reconciler.reconcile_chunk(slot, &pairs, hard_timeout)
        })
        .await;

        match decisions {
            Ok(decisions) => decisions,
            Err(e) => {
                error!(pass, slot, error = %e, "reconciliation task failed, items stay pending");
                Vec::new()
            }
        }
    }

    /// After cancellation only finished downloads are kept; nothing else is judged
    async fn salvage(&self, pass: u32, slot: usize, items: &[ItemId]) {
        let reconciler = self.reconciler.clone();
        let isolation = self.isolation.clone();
        let items = items.to_vec();
        let present = tokio::task::spawn_blocking(move || {
            items
                .into_iter()
                .filter(|id| {
                    let dst = reconciler.shared_item_dir(id);
                    move_item(&isolation.item_dir(slot, id), &dst);
                    folder_has_files(&dst)
                })
                .collect::<Vec<_>>()
        })
        .await;

        let present = match present {
            Ok(present) => present,
            Err(e) => {
                error!(pass, slot, error = %e, "salvage task failed, items stay pending");
                return;
            }
        };
        for id in present {
            self.store.set(&id, Outcome::Success);
            self.emit(Event::ItemFinalized {
                id,
                outcome: Outcome::Success,
            });
        }
    }
}

fn transition(pass: u32, slot: usize, state: WorkerState) {
    debug!(pass, slot, ?state, "worker state");
}

/// Run one chunk to completion and record every item's outcome in the store
pub async fn run_worker(ctx: Arc<WorkerContext>, job: WorkerJob) -> WorkerReport {
    let WorkerJob {
        pass,
        slot,
        items,
        rate_limited,
    } = job;
    transition(pass, slot, WorkerState::Starting);

    let invocation = match ctx.prepare(pass, slot, &items).await {
        Ok(invocation) => invocation,
        Err(e) => return ctx.abandon(pass, slot, &items, e.to_string()).await,
    };

    transition(pass, slot, WorkerState::Running);
    info!(
        pass,
        slot,
        items = items.len(),
        budget_secs = invocation.timeout.as_secs(),
        log = %invocation.log_path.display(),
        "starting {} instance",
        ctx.runner.name()
    );
    ctx.emit(Event::WorkerStarted {
        pass,
        slot,
        items: items.len(),
        log_path: invocation.log_path.clone(),
    });

    let run = ctx.runner.run(&invocation).await;
    remove_script(&invocation.script_path, slot).await;
    let run = match run {
        Ok(run) => run,
        Err(e) => return ctx.abandon(pass, slot, &items, e.to_string()).await,
    };

    let (state, hard_timeout) = match run.exit {
        ProcessExit::Completed { code } => {
            debug!(pass, slot, ?code, "instance exited");
            (WorkerState::Completed, false)
        }
        ProcessExit::HardTimeout => {
            warn!(
                pass,
                slot,
                elapsed_secs = run.elapsed.as_secs(),
                "instance exceeded its budget and was killed"
            );
            (WorkerState::HardTimeout, true)
        }
        ProcessExit::Cancelled => (WorkerState::Cancelled, false),
    };
    transition(pass, slot, state);

    let classified = classify_log_file(&invocation.log_path, &items).await;
    let mut signals = classified.signals;
    signals.timed_out |= hard_timeout;
    if signals.rate_limited {
        rate_limited.store(true, Ordering::Release);
    }

    if state == WorkerState::Cancelled {
        ctx.salvage(pass, slot, &items).await;
        ctx.isolation.reset_staging(slot).await;
        return WorkerReport {
            slot,
            state,
            signals,
            discrepancies: Vec::new(),
        };
    }

    let decisions = ctx
        .reconcile(pass, slot, &classified, &items, hard_timeout)
        .await;
    let mut discrepancies = Vec::new();
    for decision in &decisions {
        let outcome = decision.decision.outcome;
        ctx.store.set(&decision.id, outcome);
        ctx.emit(Event::ItemFinalized {
            id: decision.id.clone(),
            outcome,
        });
        if decision.decision.discrepancy {
            discrepancies.push(decision.id.clone());
            ctx.emit(Event::Discrepancy {
                id: decision.id.clone(),
                pass,
            });
        }
    }
    ctx.isolation.reset_staging(slot).await;

    let succeeded = decisions
        .iter()
        .filter(|d| d.decision.outcome == Outcome::Success)
        .count();
    info!(
        pass,
        slot,
        succeeded,
        failed = decisions.len() - succeeded,
        success_lines = classified.success_lines,
        failure_lines = classified.failure_lines,
        hard_timeout,
        "chunk reconciled"
    );
    ctx.emit(Event::WorkerFinished {
        pass,
        slot,
        hard_timeout,
        signals,
        elapsed: run.elapsed,
    });
    transition(pass, slot, WorkerState::Reconciled);

    WorkerReport {
        slot,
        state: WorkerState::Reconciled,
        signals,
        discrepancies,
    }
}

/// Log file name for a pass and slot, relative to `log_dir`
pub fn log_file_name(pass: u32, slot: usize) -> String {
    format!("instance_p{pass}_t{slot}.log")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::fake::{Behavior, ScriptedRunner};
    use tempfile::TempDir;

    fn context(
        dir: &TempDir,
        runner: Arc<dyn InstanceRunner>,
    ) -> (Arc<WorkerContext>, broadcast::Receiver<Event>) {
        let mut config = Config::default();
        config.layout.shared_root = dir.path().join("shared");
        config.layout.instances_root = dir.path().join("instances");
        config.layout.log_dir = dir.path().join("logs");
        config.layout.script_dir = dir.path().join("scripts");
        let config = Arc::new(config);

        let isolation = IsolationManager::new(&config);
        let reconciler = Reconciler::new(
            isolation.clone(),
            &config.layout.shared_root,
            &config.tool.app_id,
        );
        let (event_tx, event_rx) = broadcast::channel(256);
        let ctx = WorkerContext {
            config,
            isolation,
            reconciler,
            store: Arc::new(ResultStore::new()),
            runner,
            event_tx,
            cancel: CancellationToken::new(),
        };
        (Arc::new(ctx), event_rx)
    }

    fn job(slot: usize, ids: &[&str]) -> WorkerJob {
        WorkerJob {
            pass: 1,
            slot,
            items: ids.iter().map(|id| ItemId::from(*id)).collect(),
            rate_limited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn budget_scales_with_chunk_size() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir, Arc::new(ScriptedRunner::new()));
        assert_eq!(ctx.budget(3), Duration::from_secs(270));
        assert_eq!(ctx.budget(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn successful_chunk_is_moved_and_recorded() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut rx) = context(&dir, Arc::new(ScriptedRunner::new()));

        let report = run_worker(ctx.clone(), job(0, &["1111111", "2222222"])).await;

        assert_eq!(report.state, WorkerState::Reconciled);
        assert!(!report.signals.any());
        for id in ["1111111", "2222222"] {
            let id = ItemId::from(id);
            assert_eq!(ctx.store.outcome(&id), Some(Outcome::Success));
            assert!(ctx.reconciler.is_present(&id));
        }
        assert!(dir.path().join("logs").join(log_file_name(1, 0)).is_file());
        assert!(
            !dir.path().join("scripts/t0/script.txt").exists(),
            "script is deleted after use"
        );

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(Event::WorkerStarted { slot: 0, items: 2, .. })));
        assert!(matches!(
            events.last(),
            Some(Event::WorkerFinished { hard_timeout: false, .. })
        ));
    }

    #[tokio::test]
    async fn hard_timeout_marks_missing_items_as_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().script("2222222", &[Behavior::Hang]);
        let (ctx, _rx) = context(&dir, Arc::new(runner));

        let report = run_worker(ctx.clone(), job(1, &["1111111", "2222222", "3333333"])).await;

        assert_eq!(report.state, WorkerState::Reconciled);
        assert!(report.signals.timed_out);
        // the item finished before the kill is still a success
        assert_eq!(ctx.store.outcome(&ItemId::from("1111111")), Some(Outcome::Success));
        assert_eq!(ctx.store.outcome(&ItemId::from("2222222")), Some(Outcome::Timeout));
        assert_eq!(ctx.store.outcome(&ItemId::from("3333333")), Some(Outcome::Timeout));
    }

    #[tokio::test]
    async fn claimed_success_without_files_is_a_discrepancy() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().script("5555555", &[Behavior::ClaimOnly]);
        let (ctx, mut rx) = context(&dir, Arc::new(runner));

        let report = run_worker(ctx.clone(), job(0, &["5555555"])).await;

        assert_eq!(report.discrepancies, vec![ItemId::from("5555555")]);
        assert_eq!(
            ctx.store.outcome(&ItemId::from("5555555")),
            Some(Outcome::ValidationFailed)
        );
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, Event::Discrepancy { pass: 1, .. }))
        );
    }

    #[tokio::test]
    async fn lock_failure_is_recorded_as_lock_contention() {
        let dir = TempDir::new().unwrap();
        let runner =
            ScriptedRunner::new().script("7777777", &[Behavior::Result("Locking Failed")]);
        let (ctx, _rx) = context(&dir, Arc::new(runner));

        let report = run_worker(ctx.clone(), job(0, &["7777777"])).await;

        assert!(report.signals.lock_contended);
        assert_eq!(
            ctx.store.outcome(&ItemId::from("7777777")),
            Some(Outcome::LockContended)
        );
    }

    #[tokio::test]
    async fn throttling_raises_the_pass_flag() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().script("8888888", &[Behavior::RateLimited]);
        let (ctx, _rx) = context(&dir, Arc::new(runner));
        let job = job(0, &["8888888", "9999999"]);
        let flag = job.rate_limited.clone();

        run_worker(ctx.clone(), job).await;

        assert!(flag.load(Ordering::Acquire));
        assert_eq!(
            ctx.store.outcome(&ItemId::from("8888888")),
            Some(Outcome::RateLimited)
        );
        assert_eq!(ctx.store.outcome(&ItemId::from("9999999")), Some(Outcome::Success));
    }

    #[tokio::test]
    async fn spawn_failure_abandons_the_chunk() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().fail_spawn(1, 2);
        let (ctx, mut rx) = context(&dir, Arc::new(runner));
        ctx.store.mark_pending(&ItemId::from("1234567"));

        let report = run_worker(ctx.clone(), job(2, &["1234567"])).await;

        assert_eq!(report.state, WorkerState::Abandoned);
        assert_eq!(ctx.store.outcome(&ItemId::from("1234567")), Some(Outcome::Unknown));
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, Event::ChunkAbandoned { slot: 2, items: 1, .. }))
        );
    }

    #[tokio::test]
    async fn unwritable_script_dir_abandons_before_launch() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _rx) = context(&dir, runner.clone());
        std::fs::write(dir.path().join("scripts"), b"not a directory").unwrap();

        let report = run_worker(ctx.clone(), job(0, &["1234567"])).await;

        assert_eq!(report.state, WorkerState::Abandoned);
        assert!(runner.launches().is_empty(), "no instance may start");
        assert_eq!(ctx.store.outcome(&ItemId::from("1234567")), None);
    }

    #[tokio::test]
    async fn cancellation_keeps_finished_downloads_only() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().script("2222222", &[Behavior::Result("Failure")]);
        let (ctx, _rx) = context(&dir, Arc::new(runner));
        ctx.cancel.cancel();

        let report = run_worker(ctx.clone(), job(0, &["1111111", "2222222"])).await;

        assert_eq!(report.state, WorkerState::Cancelled);
        assert_eq!(ctx.store.outcome(&ItemId::from("1111111")), Some(Outcome::Success));
        assert_eq!(ctx.store.outcome(&ItemId::from("2222222")), None);
    }

    #[tokio::test]
    async fn script_lists_every_chunk_item_in_order() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _rx) = context(&dir, runner.clone());

        run_worker(ctx, job(3, &["3000003", "1000001", "2000002"])).await;

        let launches = runner.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].slot, 3);
        assert_eq!(launches[0].pass, 1);
        let ids: Vec<_> = launches[0].items.iter().map(ItemId::as_str).collect();
        assert_eq!(ids, vec!["3000003", "1000001", "2000002"]);
    }
}
