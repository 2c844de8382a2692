//! Post-dispatch hook queue.
//!
//! Learning and bookkeeping collaborators observe dispatch outcomes through
//! [`OutcomeHook`]. Events go through a bounded channel to one background worker,
//! so the dispatch path never waits on a hook. Each hook call runs in its own task,
//! which keeps a panicking hook from taking the worker down, and is bounded by a
//! per-hook timeout and the queue's cancel signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdc_core::Channel;
use rdc_transport::RunCancel;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::report::DispatchStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub run_id: Uuid,
    pub opportunity_key: String,
    pub platform: String,
    pub ev: f64,
    pub channel: Channel,
    pub destination: String,
    pub status: DispatchStatus,
    pub attempts: u32,
}

#[async_trait]
pub trait OutcomeHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_outcome(&self, event: &DispatchEvent) -> anyhow::Result<()>;
}

/// Emits one `dispatch_outcome` event per outcome.
pub struct TracingOutcomeHook;

#[async_trait]
impl OutcomeHook for TracingOutcomeHook {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn on_outcome(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        info!(
            event = "dispatch_outcome",
            run_id = %event.run_id,
            key = %event.opportunity_key,
            channel = %event.channel,
            destination = %event.destination,
            status = event.status.as_str(),
            attempts = event.attempts
        );
        Ok(())
    }
}

/// `delivered` and `failed` count hook calls; `dropped` counts events that did not
/// reach every hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookQueueStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct HookCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl HookCounters {
    fn snapshot(&self) -> HookQueueStats {
        HookQueueStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Cheap handle for submitting events from dispatch tasks.
#[derive(Debug, Clone)]
pub struct HookSender {
    tx: mpsc::Sender<DispatchEvent>,
    counters: Arc<HookCounters>,
}

impl HookSender {
    /// Enqueue without waiting. Returns `false` and counts a drop when the queue is
    /// full or already stopped.
    pub fn submit(&self, event: DispatchEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "hook queue rejected dispatch event");
                false
            }
        }
    }
}

pub struct HookQueue {
    sender: HookSender,
    counters: Arc<HookCounters>,
    cancel: RunCancel,
    worker: JoinHandle<()>,
}

impl HookQueue {
    pub fn spawn(
        hooks: Vec<Arc<dyn OutcomeHook>>,
        capacity: usize,
        hook_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(HookCounters::default());
        let cancel = RunCancel::new();
        let worker = tokio::spawn(run_worker(
            hooks,
            rx,
            counters.clone(),
            cancel.clone(),
            hook_timeout,
        ));
        Self {
            sender: HookSender {
                tx,
                counters: counters.clone(),
            },
            counters,
            cancel,
            worker,
        }
    }

    pub fn sender(&self) -> HookSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> HookQueueStats {
        self.counters.snapshot()
    }

    /// Stop the worker and abort the hook call in flight. Events that did not reach
    /// every hook count as dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the queue and wait for the worker to finish delivering what was
    /// queued. Every outstanding [`HookSender`] must be dropped first.
    pub async fn shutdown(self) -> HookQueueStats {
        let Self {
            sender,
            counters,
            worker,
            ..
        } = self;
        drop(sender);
        if let Err(err) = worker.await {
            warn!(error = %err, "hook worker ended abnormally");
        }
        counters.snapshot()
    }

    /// [`HookQueue::shutdown`] that gives up on the backlog once `run_cancel` fires,
    /// whether it fired before or during the drain.
    pub async fn shutdown_or_cancel(self, run_cancel: &RunCancel) -> HookQueueStats {
        let Self {
            sender,
            counters,
            cancel,
            mut worker,
        } = self;
        drop(sender);
        let drained = tokio::select! {
            biased;
            _ = run_cancel.cancelled() => None,
            joined = &mut worker => Some(joined),
        };
        let joined = match drained {
            Some(joined) => joined,
            None => {
                cancel.cancel();
                worker.await
            }
        };
        if let Err(err) = joined {
            warn!(error = %err, "hook worker ended abnormally");
        }
        counters.snapshot()
    }
}

async fn run_worker(
    hooks: Vec<Arc<dyn OutcomeHook>>,
    mut rx: mpsc::Receiver<DispatchEvent>,
    counters: Arc<HookCounters>,
    cancel: RunCancel,
    hook_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => {
                    if !deliver(&hooks, event, &counters, hook_timeout, &cancel).await {
                        break;
                    }
                }
                None => return,
            },
        }
    }

    rx.close();
    let mut abandoned = 0u64;
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    counters.dropped.fetch_add(abandoned, Ordering::Relaxed);
    debug!(abandoned, "hook worker cancelled");
}

/// Returns `false` when `cancel` fired mid-event; the event then counts as dropped.
async fn deliver(
    hooks: &[Arc<dyn OutcomeHook>],
    event: DispatchEvent,
    counters: &HookCounters,
    hook_timeout: Duration,
    cancel: &RunCancel,
) -> bool {
    let event = Arc::new(event);
    for hook in hooks {
        let name = hook.name();
        let task_hook = hook.clone();
        let task_event = event.clone();
        let mut handle = tokio::spawn(async move { task_hook.on_outcome(&task_event).await });
        let settled = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = tokio::time::timeout(hook_timeout, &mut handle) => Some(joined),
        };
        let Some(joined) = settled else {
            handle.abort();
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(hook = name, run_id = %event.run_id, "outcome hook abandoned on cancel");
            return false;
        };
        match joined {
            Ok(Ok(Ok(()))) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(Err(err))) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(hook = name, run_id = %event.run_id, error = %err, "outcome hook failed");
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(hook = name, run_id = %event.run_id, error = %err, "outcome hook panicked");
            }
            Err(_) => {
                handle.abort();
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    hook = name,
                    run_id = %event.run_id,
                    timeout_ms = hook_timeout.as_millis() as u64,
                    "outcome hook timed out"
                );
            }
        }
    }
    true
}
