//! Dispatch pipeline for RDC: configuration, consent, dedup & rank, the run
//! orchestrator, post-dispatch hooks, and run reports.

pub mod config;
pub mod consent;
pub mod hooks;
pub mod orchestrator;
pub mod rank;
pub mod report;

pub use config::{ConfigError, DispatchConfig};
pub use consent::{normalize_contact, AuditAction, AuditEntry, ConsentGate, ConsentState};
pub use hooks::{
    DispatchEvent, HookQueue, HookQueueStats, HookSender, OutcomeHook, TracingOutcomeHook,
};
pub use orchestrator::{
    idempotency_key, ComposedRequest, Composer, DispatchError, Dispatcher, EnvelopeComposer,
};
pub use rank::{
    decode_batch, dedupe_and_rank, rank_batch, BatchRecord, FileSeenKeys, RankOutcome, SeenKeys,
    SkipReason, SkippedItem,
};
pub use report::{
    write_run_report, ChannelOutcome, ChannelTally, DispatchStatus, ItemReport, PhaseTransition,
    RunCounters, RunError, RunPhase, RunReport,
};
