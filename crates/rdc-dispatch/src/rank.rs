//! Dedup & rank: validate drafts, drop keys already seen, and order by EV.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rdc_core::{compute_ev, compute_key, Opportunity, OpportunityDraft, RankedOpportunity};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Caller-owned set of opportunity keys already handled.
pub trait SeenKeys {
    fn contains_key(&self, key: &str) -> bool;
    /// Returns `true` when the key was not present before.
    fn insert_key(&mut self, key: String) -> bool;
}

impl SeenKeys for HashSet<String> {
    fn contains_key(&self, key: &str) -> bool {
        self.contains(key)
    }

    fn insert_key(&mut self, key: String) -> bool {
        self.insert(key)
    }
}

impl SeenKeys for BTreeSet<String> {
    fn contains_key(&self, key: &str) -> bool {
        self.contains(key)
    }

    fn insert_key(&mut self, key: String) -> bool {
        self.insert(key)
    }
}

/// Newline-delimited key file used for dedup across runs.
///
/// Inserts stay in memory until [`FileSeenKeys::persist`], which rewrites the file
/// through a temp file and an atomic rename.
#[derive(Debug)]
pub struct FileSeenKeys {
    path: PathBuf,
    keys: BTreeSet<String>,
    dirty: bool,
}

impl FileSeenKeys {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = match fs::read_to_string(&path).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading seen keys {}", path.display()))
            }
        };
        debug!(path = %path.display(), keys = keys.len(), "opened seen-key store");
        Ok(Self {
            path,
            keys,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub async fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        let mut body = String::with_capacity(self.keys.len() * 65);
        for key in &self.keys {
            body.push_str(key);
            body.push('\n');
        }

        let temp_path = parent.join(format!(".{}.seen.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp seen-key file {}", temp_path.display()))?;
        file.write_all(body.as_bytes())
            .await
            .with_context(|| format!("writing temp seen-key file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp seen-key file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("replacing {}", self.path.display()));
        }
        self.dirty = false;
        Ok(())
    }
}

impl SeenKeys for FileSeenKeys {
    fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert_key(&mut self, key: String) -> bool {
        let inserted = self.keys.insert(key);
        self.dirty |= inserted;
        inserted
    }
}

/// One element of an input batch, in batch order.
#[derive(Debug, Clone)]
pub enum BatchRecord {
    Draft(OpportunityDraft),
    /// Did not decode as a draft; carries the decoder's message.
    Undecodable(String),
}

impl From<OpportunityDraft> for BatchRecord {
    fn from(draft: OpportunityDraft) -> Self {
        BatchRecord::Draft(draft)
    }
}

/// Decode each element on its own so one bad record does not sink the batch.
pub fn decode_batch(values: Vec<serde_json::Value>) -> Vec<BatchRecord> {
    values
        .into_iter()
        .map(|value| match serde_json::from_value::<OpportunityDraft>(value) {
            Ok(draft) => BatchRecord::Draft(draft),
            Err(err) => BatchRecord::Undecodable(err.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Malformed,
    Duplicate,
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    /// Position in the input batch.
    pub index: usize,
    pub reason: SkipReason,
    pub detail: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankOutcome {
    pub ranked: Vec<RankedOpportunity>,
    pub received: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub truncated: usize,
    pub skipped: Vec<SkippedItem>,
}

/// Validate, dedupe against `seen`, and return at most `limit` items in EV order.
///
/// Every new key is inserted into `seen`, including keys whose items fall past
/// `limit`.
pub fn dedupe_and_rank<S>(drafts: Vec<OpportunityDraft>, seen: &mut S, limit: usize) -> RankOutcome
where
    S: SeenKeys + ?Sized,
{
    rank_batch(drafts.into_iter().map(BatchRecord::from).collect(), seen, limit)
}

/// [`dedupe_and_rank`] over a raw batch; undecodable records count as malformed.
pub fn rank_batch<S>(records: Vec<BatchRecord>, seen: &mut S, limit: usize) -> RankOutcome
where
    S: SeenKeys + ?Sized,
{
    let mut outcome = RankOutcome {
        received: records.len(),
        ..RankOutcome::default()
    };
    let mut kept: Vec<(usize, String, f64, Opportunity)> = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let validated = match record {
            BatchRecord::Draft(draft) => Opportunity::try_from(draft).map_err(|err| err.to_string()),
            BatchRecord::Undecodable(message) => Err(format!("undecodable record: {message}")),
        };
        let opportunity = match validated {
            Ok(opportunity) => opportunity,
            Err(detail) => {
                outcome.malformed += 1;
                outcome.skipped.push(SkippedItem {
                    index,
                    reason: SkipReason::Malformed,
                    detail,
                    key: None,
                });
                continue;
            }
        };

        let key = compute_key(&opportunity);
        if !seen.insert_key(key.clone()) {
            outcome.duplicates += 1;
            outcome.skipped.push(SkippedItem {
                index,
                reason: SkipReason::Duplicate,
                detail: format!("{}:{}", opportunity.platform, opportunity.identifier()),
                key: Some(key),
            });
            continue;
        }

        let ev = compute_ev(&opportunity);
        kept.push((index, key, ev, opportunity));
    }

    // sort_by is stable, so equal EVs keep input order
    kept.sort_by(|a, b| b.2.total_cmp(&a.2));

    for (position, (index, key, ev, opportunity)) in kept.into_iter().enumerate() {
        if position >= limit {
            outcome.truncated += 1;
            outcome.skipped.push(SkippedItem {
                index,
                reason: SkipReason::Truncated,
                detail: format!("ev {ev:.2} below rank limit {limit}"),
                key: Some(key),
            });
            continue;
        }
        outcome.ranked.push(RankedOpportunity {
            key,
            ev,
            rank: position + 1,
            opportunity,
        });
    }

    outcome
}
