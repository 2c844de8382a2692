use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rdc_core::{Channel, RankedOpportunity};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::hooks::HookQueueStats;
use crate::rank::SkippedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    Ranking,
    Dispatching,
    Completed,
    Cancelled,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Created => "created",
            RunPhase::Ranking => "ranking",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Completed => "completed",
            RunPhase::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: RunPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Dry run: the call would have been attempted.
    Planned,
    Succeeded,
    Failed,
    CircuitOpen,
    ConsentDenied,
    Cancelled,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Planned => "planned",
            DispatchStatus::Succeeded => "succeeded",
            DispatchStatus::Failed => "failed",
            DispatchStatus::CircuitOpen => "circuit_open",
            DispatchStatus::ConsentDenied => "consent_denied",
            DispatchStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub received: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub truncated: usize,
    pub ranked: usize,
    pub no_contact: usize,
    pub consent_denied: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Extra tries beyond the first, summed over all calls.
    pub retried: usize,
    pub circuit_open: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: Channel,
    pub destination: String,
    pub idempotency_key: String,
    pub status: DispatchStatus,
    pub attempts: u32,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub rank: usize,
    pub key: String,
    pub ev: f64,
    pub platform: String,
    pub title: String,
    pub outcomes: Vec<ChannelOutcome>,
}

impl ItemReport {
    pub fn from_ranked(ranked: &RankedOpportunity) -> Self {
        Self {
            rank: ranked.rank,
            key: ranked.key.clone(),
            ev: ranked.ev,
            platform: ranked.opportunity.platform.clone(),
            title: ranked.opportunity.title.clone(),
            outcomes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTally {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub circuit_open: usize,
    pub consent_denied: usize,
    pub cancelled: usize,
}

impl ChannelTally {
    pub fn record(&mut self, status: DispatchStatus) {
        let slot = match status {
            DispatchStatus::Planned => &mut self.planned,
            DispatchStatus::Succeeded => &mut self.succeeded,
            DispatchStatus::Failed => &mut self.failed,
            DispatchStatus::CircuitOpen => &mut self.circuit_open,
            DispatchStatus::ConsentDenied => &mut self.consent_denied,
            DispatchStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub key: Option<String>,
    pub destination: Option<String>,
    pub kind: String,
    pub message: String,
}

/// Immutable summary of one dispatch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub phase: RunPhase,
    /// Every phase the run entered, in order.
    pub phases: Vec<PhaseTransition>,
    pub counters: RunCounters,
    pub items: Vec<ItemReport>,
    pub channels: BTreeMap<String, ChannelTally>,
    pub skipped: Vec<SkippedItem>,
    pub errors: Vec<RunError>,
    pub hooks: Option<HookQueueStats>,
}

impl RunReport {
    /// Start an empty report in [`RunPhase::Created`].
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run,
            phase: RunPhase::Created,
            phases: vec![PhaseTransition {
                phase: RunPhase::Created,
                at: started_at,
            }],
            counters: RunCounters::default(),
            items: Vec::new(),
            channels: BTreeMap::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            hooks: None,
        }
    }

    pub fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.phases.push(PhaseTransition {
            phase,
            at: Utc::now(),
        });
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.items.iter().flat_map(|item| item.outcomes.iter())
    }
}

fn render_summary(report: &RunReport) -> String {
    let c = &report.counters;
    let mut out = format!(
        "# Dispatch Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Phase: {}\n- Dry run: {}\n\n## Counters\n- received: {}\n- malformed: {}\n- duplicates: {}\n- truncated: {}\n- ranked: {}\n- no_contact: {}\n- consent_denied: {}\n- attempted: {}\n- succeeded: {}\n- failed: {}\n- retried: {}\n- circuit_open: {}\n- cancelled: {}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.phase.as_str(),
        report.dry_run,
        c.received,
        c.malformed,
        c.duplicates,
        c.truncated,
        c.ranked,
        c.no_contact,
        c.consent_denied,
        c.attempted,
        c.succeeded,
        c.failed,
        c.retried,
        c.circuit_open,
        c.cancelled,
    );

    let path: Vec<&str> = report.phases.iter().map(|t| t.phase.as_str()).collect();
    out.push_str(&format!("- Phases: {}\n", path.join(" -> ")));

    out.push_str("\n## Channels\n");
    for (channel, tally) in &report.channels {
        out.push_str(&format!(
            "- {channel}: planned {}, succeeded {}, failed {}, circuit_open {}, consent_denied {}, cancelled {}\n",
            tally.planned,
            tally.succeeded,
            tally.failed,
            tally.circuit_open,
            tally.consent_denied,
            tally.cancelled
        ));
    }

    out.push_str("\n## Top Items\n");
    for item in report.items.iter().take(10) {
        out.push_str(&format!(
            "{}. {} ({}) EV {:.2}\n",
            item.rank, item.title, item.platform, item.ev
        ));
    }

    if !report.errors.is_empty() {
        out.push_str(&format!("\n## Errors ({})\n", report.errors.len()));
        for error in &report.errors {
            out.push_str(&format!(
                "- [{}] {}: {}\n",
                error.kind,
                error.destination.as_deref().unwrap_or("-"),
                error.message
            ));
        }
    }
    out
}

/// Write `<dir>/<run_id>/run_report.json` and `run_summary.md`; returns the run directory.
pub async fn write_run_report(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    fs::write(run_dir.join("run_summary.md"), render_summary(report))
        .await
        .context("writing run_summary.md")?;

    Ok(run_dir)
}
