//! Run orchestrator: rank a batch, then fan out consented, governed, breaker-aware
//! calls in EV order and fold every outcome into a [`RunReport`].
//!
//! Targets are grouped into one lane per concurrency class. A lane admits its
//! targets strictly in rank order, so a saturated class grants slots by EV while
//! other classes proceed independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rdc_core::{Channel, ContactTarget, OpportunityDraft, RankedOpportunity};
use rdc_transport::{
    CallContext, CallError, CircuitBreakerRegistry, ConcurrencyGovernor, OutboundRequest,
    ResilientCaller, RunCancel, Slot, Transport,
};
use reqwest::Method;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, DispatchConfig};
use crate::consent::ConsentGate;
use crate::hooks::{DispatchEvent, HookQueue, HookQueueStats, HookSender, OutcomeHook};
use crate::rank::{rank_batch, BatchRecord, SeenKeys};
use crate::report::{ChannelOutcome, DispatchStatus, ItemReport, RunError, RunPhase, RunReport};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// `{run_id}:{opportunity_key}:{channel}`; identical on every retry of one call.
pub fn idempotency_key(run_id: Uuid, opportunity_key: &str, channel: Channel) -> String {
    format!("{run_id}:{opportunity_key}:{channel}")
}

#[derive(Debug, Clone)]
pub struct ComposedRequest {
    pub method: Method,
    /// Overrides the transport's endpoint for the destination class.
    pub url: Option<String>,
    pub payload: serde_json::Value,
}

/// Message composition collaborator.
pub trait Composer: Send + Sync {
    fn compose(
        &self,
        run_id: Uuid,
        ranked: &RankedOpportunity,
        target: &ContactTarget,
    ) -> Result<ComposedRequest>;
}

/// Default composer: a JSON envelope describing the opportunity and recipient.
#[derive(Default)]
pub struct EnvelopeComposer;

impl Composer for EnvelopeComposer {
    fn compose(
        &self,
        run_id: Uuid,
        ranked: &RankedOpportunity,
        target: &ContactTarget,
    ) -> Result<ComposedRequest> {
        let opportunity = &ranked.opportunity;
        Ok(ComposedRequest {
            method: Method::POST,
            url: None,
            payload: serde_json::json!({
                "run_id": run_id,
                "opportunity_key": ranked.key,
                "rank": ranked.rank,
                "ev": ranked.ev,
                "platform": opportunity.platform,
                "external_id": opportunity.external_id,
                "url": opportunity.url,
                "title": opportunity.title,
                "channel": target.channel,
                "destination": target.destination.class_key(),
                "to": target.address,
            }),
        })
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    transport: Arc<dyn Transport>,
    consent: Arc<ConsentGate>,
    breakers: Arc<CircuitBreakerRegistry>,
    composer: Arc<dyn Composer>,
    hooks: Vec<Arc<dyn OutcomeHook>>,
}

impl Dispatcher {
    /// The breaker registry lives as long as the dispatcher, so destination health
    /// carries across runs. The config is validated at the start of every run.
    pub fn new(config: DispatchConfig, transport: Arc<dyn Transport>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker_config()));
        Self {
            config,
            transport,
            consent: Arc::new(ConsentGate::new()),
            breakers,
            composer: Arc::new(EnvelopeComposer),
            hooks: Vec::new(),
        }
    }

    pub fn with_consent(mut self, consent: Arc<ConsentGate>) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn Composer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn OutcomeHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn consent(&self) -> &Arc<ConsentGate> {
        &self.consent
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn run_dispatch<S>(
        &self,
        drafts: Vec<OpportunityDraft>,
        seen: &mut S,
    ) -> Result<RunReport, DispatchError>
    where
        S: SeenKeys + ?Sized,
    {
        self.run_dispatch_with_cancel(drafts, seen, RunCancel::new())
            .await
    }

    /// Run with an external cancel signal. The configured deadline, if any, fires
    /// the same signal.
    pub async fn run_dispatch_with_cancel<S>(
        &self,
        drafts: Vec<OpportunityDraft>,
        seen: &mut S,
        cancel: RunCancel,
    ) -> Result<RunReport, DispatchError>
    where
        S: SeenKeys + ?Sized,
    {
        let records = drafts.into_iter().map(BatchRecord::from).collect();
        self.run_batch_with_cancel(records, seen, cancel).await
    }

    /// Run a raw batch in which some records may not have decoded. Those land in
    /// the report as malformed, at their batch index.
    pub async fn run_batch_with_cancel<S>(
        &self,
        records: Vec<BatchRecord>,
        seen: &mut S,
        cancel: RunCancel,
    ) -> Result<RunReport, DispatchError>
    where
        S: SeenKeys + ?Sized,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("dispatch_run", %run_id, dry_run = self.config.dry_run);
        self.run_inner(run_id, records, seen, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner<S>(
        &self,
        run_id: Uuid,
        records: Vec<BatchRecord>,
        seen: &mut S,
        cancel: RunCancel,
    ) -> Result<RunReport, DispatchError>
    where
        S: SeenKeys + ?Sized,
    {
        let mut report = RunReport::new(run_id, Utc::now(), self.config.dry_run);
        report.counters.received = records.len();
        info!(event = "run_phase", %run_id, phase = "created", batch = records.len());

        if let Err(err) = self.config.validate() {
            error!(event = "run_aborted", %run_id, error = %err, "invalid dispatch config");
            return Err(err.into());
        }

        let deadline = self.config.deadline().map(|d| cancel.cancel_after(d));

        if cancel.is_cancelled() {
            warn!(event = "run_phase", %run_id, phase = "cancelled", "cancelled before ranking");
            if let Some(timer) = deadline {
                timer.abort();
            }
            report.enter(RunPhase::Cancelled);
            report.finished_at = Utc::now();
            return Ok(report);
        }

        report.enter(RunPhase::Ranking);
        info!(event = "run_phase", %run_id, phase = "ranking");
        let ranking = rank_batch(records, seen, self.config.rank_limit);
        let counters = &mut report.counters;
        counters.malformed = ranking.malformed;
        counters.duplicates = ranking.duplicates;
        counters.truncated = ranking.truncated;
        counters.ranked = ranking.ranked.len();
        report.skipped = ranking.skipped;
        report.items = ranking.ranked.iter().map(ItemReport::from_ranked).collect();

        report.enter(RunPhase::Dispatching);
        info!(
            event = "run_phase",
            %run_id,
            phase = "dispatching",
            ranked = report.counters.ranked,
            malformed = report.counters.malformed,
            duplicates = report.counters.duplicates,
            truncated = report.counters.truncated
        );

        let finished = if self.config.dry_run {
            self.plan(run_id, &ranking.ranked).await
        } else {
            self.dispatch(run_id, ranking.ranked, &cancel).await
        };

        if let Some(timer) = deadline {
            timer.abort();
        }

        let mut finished_outcomes = finished.outcomes;
        finished_outcomes.sort_by_key(|o| (o.item, o.order));
        let counters = &mut report.counters;
        counters.no_contact = finished.no_contact;
        for done in finished_outcomes {
            let outcome = done.outcome;
            counters.retried += outcome.attempts.saturating_sub(1) as usize;
            if outcome.attempts > 0 {
                counters.attempted += 1;
            }
            match outcome.status {
                DispatchStatus::Planned => {}
                DispatchStatus::Succeeded => counters.succeeded += 1,
                DispatchStatus::Failed => counters.failed += 1,
                DispatchStatus::CircuitOpen => counters.circuit_open += 1,
                DispatchStatus::ConsentDenied => counters.consent_denied += 1,
                DispatchStatus::Cancelled => counters.cancelled += 1,
            }
            report
                .channels
                .entry(outcome.channel.as_str().to_string())
                .or_default()
                .record(outcome.status);
            if let Some(err) = done.error {
                report.errors.push(err);
            }
            if let Some(item) = report.items.get_mut(done.item) {
                item.outcomes.push(outcome);
            }
        }
        report.errors.extend(finished.task_errors);
        report.hooks = finished.hooks;

        report.enter(if cancel.is_cancelled() {
            RunPhase::Cancelled
        } else {
            RunPhase::Completed
        });
        report.finished_at = Utc::now();
        info!(
            event = "run_phase",
            %run_id,
            phase = report.phase.as_str(),
            attempted = report.counters.attempted,
            succeeded = report.counters.succeeded,
            failed = report.counters.failed,
            circuit_open = report.counters.circuit_open,
            consent_denied = report.counters.consent_denied,
            cancelled = report.counters.cancelled
        );
        Ok(report)
    }

    /// Dry run: resolve targets and consent only.
    async fn plan(&self, run_id: Uuid, ranked: &[RankedOpportunity]) -> Finished {
        let mut finished = Finished::default();
        for (item, opportunity) in ranked.iter().enumerate() {
            let targets = opportunity.opportunity.contact_targets();
            if targets.is_empty() {
                finished.no_contact += 1;
                continue;
            }
            for (order, target) in targets.into_iter().enumerate() {
                let status = if self.consent.is_allowed(&target.address, target.channel).await {
                    DispatchStatus::Planned
                } else {
                    DispatchStatus::ConsentDenied
                };
                info!(
                    event = "dispatch_planned",
                    %run_id,
                    key = %opportunity.key,
                    channel = %target.channel,
                    status = status.as_str()
                );
                finished.outcomes.push(TaskOutcome {
                    item,
                    order,
                    outcome: ChannelOutcome {
                        channel: target.channel,
                        destination: target.destination.class_key(),
                        idempotency_key: idempotency_key(run_id, &opportunity.key, target.channel),
                        status,
                        attempts: 0,
                        detail: None,
                    },
                    error: None,
                });
            }
        }
        finished
    }

    async fn dispatch(
        &self,
        run_id: Uuid,
        ranked: Vec<RankedOpportunity>,
        cancel: &RunCancel,
    ) -> Finished {
        let governor = ConcurrencyGovernor::new(&self.config.governor_config());
        let caller = ResilientCaller::new(
            self.transport.clone(),
            self.breakers.clone(),
            self.config.backoff_policy(),
            self.config.call_timeout(),
        );
        let hook_queue = if self.hooks.is_empty() {
            None
        } else {
            Some(HookQueue::spawn(
                self.hooks.clone(),
                self.config.hook_queue_capacity,
                self.config.hook_timeout(),
            ))
        };

        let mut finished = Finished::default();
        let mut lanes: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for (item, opportunity) in ranked.into_iter().enumerate() {
            let targets = opportunity.opportunity.contact_targets();
            if targets.is_empty() {
                finished.no_contact += 1;
                continue;
            }
            let opportunity = Arc::new(opportunity);
            for (order, target) in targets.into_iter().enumerate() {
                lanes
                    .entry(governor.class_for(&target.destination))
                    .or_default()
                    .push(Job {
                        item,
                        order,
                        key: idempotency_key(run_id, &opportunity.key, target.channel),
                        opportunity: opportunity.clone(),
                        target,
                    });
            }
        }

        let shared = Arc::new(RunShared {
            ctx: CallContext {
                run_id,
                cancel: cancel.clone(),
            },
            max_attempts: caller.default_max_attempts(),
            consent: self.consent.clone(),
            governor,
            caller,
            composer: self.composer.clone(),
            hooks: hook_queue.as_ref().map(HookQueue::sender),
        });

        let mut tasks = JoinSet::new();
        for (class, jobs) in lanes {
            tasks.spawn(run_lane(shared.clone(), class, jobs).in_current_span());
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(lane) => finished.absorb(lane),
                Err(err) => {
                    error!(event = "dispatch_task_failed", %run_id, error = %err);
                    finished.task_errors.push(task_failure(&err));
                }
            }
        }

        drop(shared);
        if let Some(queue) = hook_queue {
            finished.hooks = Some(queue.shutdown_or_cancel(cancel).await);
        }
        finished
    }
}

struct RunShared {
    ctx: CallContext,
    max_attempts: u32,
    consent: Arc<ConsentGate>,
    governor: ConcurrencyGovernor,
    caller: ResilientCaller,
    composer: Arc<dyn Composer>,
    hooks: Option<HookSender>,
}

/// One contact target of one ranked item.
struct Job {
    item: usize,
    order: usize,
    key: String,
    opportunity: Arc<RankedOpportunity>,
    target: ContactTarget,
}

impl Job {
    fn outcome(&self, status: DispatchStatus, detail: Option<String>) -> ChannelOutcome {
        ChannelOutcome {
            channel: self.target.channel,
            destination: self.target.destination.class_key(),
            idempotency_key: self.key.clone(),
            status,
            attempts: 0,
            detail,
        }
    }

    fn error(&self, kind: &str, message: String) -> RunError {
        RunError {
            key: Some(self.opportunity.key.clone()),
            destination: Some(self.target.destination.class_key()),
            kind: kind.to_string(),
            message,
        }
    }

    /// Publish the outcome to the hook queue and tag it with the job's position.
    fn finish(
        self,
        shared: &RunShared,
        outcome: ChannelOutcome,
        error: Option<RunError>,
    ) -> TaskOutcome {
        if let Some(hooks) = &shared.hooks {
            hooks.submit(DispatchEvent {
                run_id: shared.ctx.run_id,
                opportunity_key: self.opportunity.key.clone(),
                platform: self.opportunity.opportunity.platform.clone(),
                ev: self.opportunity.ev,
                channel: outcome.channel,
                destination: outcome.destination.clone(),
                status: outcome.status,
                attempts: outcome.attempts,
            });
        }
        TaskOutcome {
            item: self.item,
            order: self.order,
            outcome,
            error,
        }
    }
}

struct TaskOutcome {
    item: usize,
    order: usize,
    outcome: ChannelOutcome,
    error: Option<RunError>,
}

#[derive(Default)]
struct Finished {
    outcomes: Vec<TaskOutcome>,
    no_contact: usize,
    task_errors: Vec<RunError>,
    hooks: Option<HookQueueStats>,
}

impl Finished {
    fn absorb(&mut self, other: Finished) {
        self.outcomes.extend(other.outcomes);
        self.no_contact += other.no_contact;
        self.task_errors.extend(other.task_errors);
    }
}

fn task_failure(err: &tokio::task::JoinError) -> RunError {
    RunError {
        key: None,
        destination: None,
        kind: "task_panic".to_string(),
        message: err.to_string(),
    }
}

/// Admit one class's jobs in order; each admitted call runs in its own task.
async fn run_lane(shared: Arc<RunShared>, class: String, jobs: Vec<Job>) -> Finished {
    let mut lane = Finished::default();
    let mut calls = JoinSet::new();
    for job in jobs {
        match admit(&shared, &job).await {
            Ok(slot) => {
                let shared = shared.clone();
                calls.spawn(
                    async move {
                        let (outcome, error) = call_target(&shared, &job, slot).await;
                        job.finish(&shared, outcome, error)
                    }
                    .in_current_span(),
                );
            }
            Err((outcome, error)) => lane.outcomes.push(job.finish(&shared, outcome, error)),
        }
    }

    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(done) => lane.outcomes.push(done),
            Err(err) => {
                error!(event = "dispatch_task_failed", run_id = %shared.ctx.run_id, %class, error = %err);
                lane.task_errors.push(task_failure(&err));
            }
        }
    }
    debug!(%class, outcomes = lane.outcomes.len(), "dispatch lane drained");
    lane
}

/// Consent, then a governor slot. An `Err` carries the job's final outcome.
async fn admit(
    shared: &RunShared,
    job: &Job,
) -> Result<Slot, (ChannelOutcome, Option<RunError>)> {
    if shared.ctx.cancel.is_cancelled() {
        let detail = Some("run cancelled before start".to_string());
        return Err((job.outcome(DispatchStatus::Cancelled, detail), None));
    }

    let target = &job.target;
    if !shared
        .consent
        .is_allowed(&target.address, target.channel)
        .await
    {
        info!(
            event = "consent_denied",
            run_id = %shared.ctx.run_id,
            key = %job.opportunity.key,
            channel = %target.channel
        );
        let detail = Some("contact suppressed or without consent".to_string());
        return Err((job.outcome(DispatchStatus::ConsentDenied, detail), None));
    }

    let acquired = tokio::select! {
        biased;
        _ = shared.ctx.cancel.cancelled() => None,
        acquired = shared.governor.acquire(&target.destination) => Some(acquired),
    };
    match acquired {
        Some(Ok(slot)) => Ok(slot),
        Some(Err(err)) => Err((
            job.outcome(DispatchStatus::Failed, Some(err.to_string())),
            Some(job.error("governor", err.to_string())),
        )),
        None => {
            let detail = Some("cancelled while waiting for a slot".to_string());
            Err((job.outcome(DispatchStatus::Cancelled, detail), None))
        }
    }
}

async fn call_target(
    shared: &RunShared,
    job: &Job,
    slot: Slot,
) -> (ChannelOutcome, Option<RunError>) {
    let composed = match shared
        .composer
        .compose(shared.ctx.run_id, &job.opportunity, &job.target)
    {
        Ok(composed) => composed,
        Err(err) => {
            let message = format!("{err:#}");
            return (
                job.outcome(DispatchStatus::Failed, Some(message.clone())),
                Some(job.error("compose", message)),
            );
        }
    };

    let request = OutboundRequest {
        method: composed.method,
        destination: job.target.destination.class_key(),
        url: composed.url,
        payload: composed.payload,
        idempotency_key: job.key.clone(),
    };
    let result = shared
        .caller
        .call(&shared.ctx, &request, shared.max_attempts)
        .await;
    drop(slot);

    match result {
        Ok(success) => {
            let mut outcome = job.outcome(DispatchStatus::Succeeded, None);
            outcome.attempts = success.attempts;
            (outcome, None)
        }
        Err(err) => {
            let status = match &err {
                CallError::CircuitOpen { .. } => DispatchStatus::CircuitOpen,
                CallError::Cancelled { .. } => DispatchStatus::Cancelled,
                _ => DispatchStatus::Failed,
            };
            let mut outcome = job.outcome(status, Some(err.to_string()));
            outcome.attempts = err.attempts();
            let error = match status {
                DispatchStatus::Cancelled => None,
                _ => Some(job.error(err.reason(), err.to_string())),
            };
            (outcome, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdc_core::{compute_ev, compute_key, Destination, Opportunity};

    #[test]
    fn idempotency_key_is_run_scoped() {
        let run_id = Uuid::nil();
        assert_eq!(
            idempotency_key(run_id, "abc", Channel::PlatformId),
            "00000000-0000-0000-0000-000000000000:abc:platform_id"
        );
    }

    #[test]
    fn envelope_names_recipient_and_opportunity() {
        let opportunity = Opportunity::try_from(OpportunityDraft {
            platform: Some("reddit".into()),
            url: Some("https://reddit.example/r/1".into()),
            title: Some("Need a CLI".into()),
            value: Some(200.0),
            win_probability: Some(0.5),
            ..OpportunityDraft::default()
        })
        .expect("valid");
        let ranked = RankedOpportunity {
            key: compute_key(&opportunity),
            ev: compute_ev(&opportunity),
            rank: 1,
            opportunity,
        };
        let target = ContactTarget {
            channel: Channel::Handle,
            destination: Destination::platform("Reddit"),
            address: "poster".into(),
        };
        let composed = EnvelopeComposer
            .compose(Uuid::nil(), &ranked, &target)
            .expect("compose");
        assert_eq!(composed.method, Method::POST);
        assert_eq!(composed.payload["destination"], "platform:reddit");
        assert_eq!(composed.payload["to"], "poster");
        assert_eq!(composed.payload["channel"], "handle");
        assert_eq!(composed.payload["ev"], 100.0);
    }
}
