//! Consent gate: suppression list, opt-in allow-list, and an append-only audit trail.
//!
//! Suppression always wins. While no live consent is on file the gate runs in
//! opt-out mode and lets every non-suppressed contact through. Consent recorded for
//! a contact that is not suppressed switches it to opt-in mode, where only contacts
//! with consent for the requested channel pass.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use rdc_core::Channel;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

const SHARDS: usize = 16;

/// Canonical form used as the consent key for emails, phone numbers, and handles.
pub fn normalize_contact(raw: &str) -> String {
    let trimmed = raw.trim();
    let looks_like_phone = !trimmed.is_empty()
        && trimmed.chars().any(|c| c.is_ascii_digit())
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.'));
    if looks_like_phone {
        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
        return if trimmed.starts_with('+') {
            format!("+{digits}")
        } else {
            digits
        };
    }
    let lowered = trimmed.to_lowercase();
    match lowered.strip_prefix('@') {
        Some(handle) if !handle.contains('@') => handle.to_string(),
        _ => lowered,
    }
}

fn email_domain(normalized: &str) -> Option<&str> {
    normalized
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConsentState {
    Unconstrained,
    Allowed { channels: BTreeSet<Channel> },
    Suppressed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    Suppressed { reason: String },
    ConsentRecorded { channel: Channel, proof: String },
    DomainSuppressed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub contact: String,
    pub action: AuditAction,
}

#[derive(Debug, Clone, Default)]
struct ConsentRecord {
    allowed: BTreeSet<Channel>,
    suppressed: Option<String>,
}

impl ConsentRecord {
    /// Counts toward opt-in mode.
    fn on_allow_list(&self) -> bool {
        self.suppressed.is_none() && !self.allowed.is_empty()
    }
}

#[derive(Debug)]
pub struct ConsentGate {
    shards: Vec<RwLock<HashMap<String, ConsentRecord>>>,
    suppressed_domains: RwLock<HashMap<String, String>>,
    allow_listed: AtomicUsize,
    audit: Mutex<Vec<AuditEntry>>,
}

impl Default for ConsentGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsentGate {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            suppressed_domains: RwLock::new(HashMap::new()),
            allow_listed: AtomicUsize::new(0),
            audit: Mutex::new(Vec::new()),
        }
    }

    fn shard(&self, normalized: &str) -> &RwLock<HashMap<String, ConsentRecord>> {
        let mut hasher = DefaultHasher::new();
        normalized.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Callers hold the write guard for the state they changed, so audit order
    /// matches the order of state changes.
    async fn append_audit(&self, contact: String, action: AuditAction) {
        let mut audit = self.audit.lock().await;
        let seq = audit.len() as u64 + 1;
        audit.push(AuditEntry {
            seq,
            at: Utc::now(),
            contact,
            action,
        });
    }

    pub fn opt_in_mode(&self) -> bool {
        self.allow_listed.load(Ordering::Acquire) > 0
    }

    pub async fn is_allowed(&self, contact: &str, channel: Channel) -> bool {
        let normalized = normalize_contact(contact);
        if normalized.is_empty() {
            return false;
        }

        let allowed_channels = {
            let shard = self.shard(&normalized).read().await;
            match shard.get(&normalized) {
                Some(record) if record.suppressed.is_some() => return false,
                Some(record) => record.allowed.contains(&channel),
                None => false,
            }
        };

        if let Some(domain) = email_domain(&normalized) {
            if self.suppressed_domains.read().await.contains_key(domain) {
                return false;
            }
        }

        !self.opt_in_mode() || allowed_channels
    }

    fn track_allow_list(&self, was_listed: bool, record: &ConsentRecord) {
        match (was_listed, record.on_allow_list()) {
            (false, true) => {
                self.allow_listed.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.allow_listed.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    pub async fn suppress(&self, contact: &str, reason: &str) {
        let normalized = normalize_contact(contact);
        let mut shard = self.shard(&normalized).write().await;
        let record = shard.entry(normalized.clone()).or_default();
        let was_listed = record.on_allow_list();
        record.suppressed = Some(reason.to_string());
        self.track_allow_list(was_listed, record);
        info!(event = "contact_suppressed", contact = %normalized, reason, "consent suppression recorded");
        self.append_audit(
            normalized,
            AuditAction::Suppressed {
                reason: reason.to_string(),
            },
        )
        .await;
    }

    /// Record consent for one channel. A suppressed contact keeps its consent on
    /// file but stays blocked, and does not switch the gate to opt-in mode.
    pub async fn record_consent(
        &self,
        contact: &str,
        channel: Channel,
        proof: &str,
    ) -> ConsentState {
        let normalized = normalize_contact(contact);
        let mut shard = self.shard(&normalized).write().await;
        let record = shard.entry(normalized.clone()).or_default();
        let was_listed = record.on_allow_list();
        record.allowed.insert(channel);
        self.track_allow_list(was_listed, record);
        let state = Self::state_of(Some(&*record));
        info!(event = "consent_recorded", contact = %normalized, %channel, "consent recorded");
        self.append_audit(
            normalized,
            AuditAction::ConsentRecorded {
                channel,
                proof: proof.to_string(),
            },
        )
        .await;
        state
    }

    /// Block every email address at `domain`.
    pub async fn suppress_domain(&self, domain: &str, reason: &str) {
        let domain = domain.trim().trim_start_matches('@').to_lowercase();
        let mut domains = self.suppressed_domains.write().await;
        domains.insert(domain.clone(), reason.to_string());
        info!(event = "domain_suppressed", %domain, reason, "domain suppression recorded");
        self.append_audit(
            format!("@{domain}"),
            AuditAction::DomainSuppressed {
                reason: reason.to_string(),
            },
        )
        .await;
    }

    fn state_of(record: Option<&ConsentRecord>) -> ConsentState {
        match record {
            Some(ConsentRecord {
                suppressed: Some(reason),
                ..
            }) => ConsentState::Suppressed {
                reason: reason.clone(),
            },
            Some(record) if !record.allowed.is_empty() => ConsentState::Allowed {
                channels: record.allowed.clone(),
            },
            _ => ConsentState::Unconstrained,
        }
    }

    pub async fn state(&self, contact: &str) -> ConsentState {
        let normalized = normalize_contact(contact);
        let shard = self.shard(&normalized).read().await;
        Self::state_of(shard.get(&normalized))
    }

    pub async fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().await.clone()
    }

    pub async fn audit_for(&self, contact: &str) -> Vec<AuditEntry> {
        let normalized = normalize_contact(contact);
        self.audit
            .lock()
            .await
            .iter()
            .filter(|entry| entry.contact == normalized)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_variants() {
        assert_eq!(normalize_contact("  A@X.com "), "a@x.com");
        assert_eq!(normalize_contact("+1 (555) 010-2000"), "+15550102000");
        assert_eq!(normalize_contact("555.010.2000"), "5550102000");
        assert_eq!(normalize_contact("@Poster"), "poster");
        assert_eq!(normalize_contact("u/poster"), "u/poster");
    }

    #[tokio::test]
    async fn opt_out_mode_allows_everyone_not_suppressed() {
        let gate = ConsentGate::new();
        assert!(!gate.opt_in_mode());
        assert!(gate.is_allowed("b@x.com", Channel::Email).await);
        gate.suppress("b@x.com", "unsubscribed").await;
        assert!(!gate.is_allowed("B@X.COM", Channel::Email).await);
        assert!(!gate.is_allowed("b@x.com", Channel::Sms).await);
    }

    #[tokio::test]
    async fn suppression_beats_later_consent() {
        let gate = ConsentGate::new();
        gate.suppress("a@x.com", "complaint").await;
        let state = gate.record_consent("a@x.com", Channel::Email, "form-123").await;
        assert_eq!(
            state,
            ConsentState::Suppressed {
                reason: "complaint".into()
            }
        );
        assert!(!gate.is_allowed("a@x.com", Channel::Email).await);
    }

    #[tokio::test]
    async fn consent_for_a_suppressed_contact_keeps_opt_out_mode() {
        let gate = ConsentGate::new();
        gate.suppress("a@x.com", "complaint").await;
        gate.record_consent("a@x.com", Channel::Email, "form-123").await;

        assert!(!gate.opt_in_mode());
        assert!(gate.is_allowed("b@x.com", Channel::Email).await);
        assert!(!gate.is_allowed("a@x.com", Channel::Email).await);
    }

    #[tokio::test]
    async fn suppressing_the_only_consented_contact_leaves_opt_in_mode() {
        let gate = ConsentGate::new();
        gate.record_consent("a@x.com", Channel::Email, "form-1").await;
        gate.record_consent("a@x.com", Channel::Sms, "form-2").await;
        assert!(gate.opt_in_mode());
        assert!(!gate.is_allowed("b@x.com", Channel::Email).await);

        gate.suppress("A@x.com", "revoked").await;
        gate.suppress("a@x.com", "revoked twice").await;
        assert!(!gate.opt_in_mode());
        assert!(gate.is_allowed("b@x.com", Channel::Email).await);
    }

    #[tokio::test]
    async fn first_consent_switches_to_opt_in() {
        let gate = ConsentGate::new();
        gate.record_consent("+1 555 010 2000", Channel::Sms, "sms-keyword").await;
        assert!(gate.opt_in_mode());

        assert!(gate.is_allowed("+15550102000", Channel::Sms).await);
        assert!(!gate.is_allowed("+15550102000", Channel::Email).await);
        assert!(!gate.is_allowed("stranger@x.com", Channel::Email).await);
    }

    #[tokio::test]
    async fn domain_suppression_blocks_every_address() {
        let gate = ConsentGate::new();
        gate.suppress_domain("Blocked.example", "do not contact").await;
        assert!(!gate.is_allowed("ceo@blocked.example", Channel::Email).await);
        assert!(gate.is_allowed("ceo@fine.example", Channel::Email).await);
    }

    #[tokio::test]
    async fn every_mutation_is_audited_in_order() {
        let gate = ConsentGate::new();
        gate.record_consent("a@x.com", Channel::Email, "proof-1").await;
        gate.suppress("a@x.com", "bounced").await;
        gate.record_consent("a@x.com", Channel::Email, "proof-2").await;
        gate.suppress("c@x.com", "manual").await;

        let all = gate.audit_trail().await;
        assert_eq!(all.len(), 4);
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let for_a = gate.audit_for(" A@x.com").await;
        assert_eq!(for_a.len(), 3);
        assert!(matches!(for_a[1].action, AuditAction::Suppressed { .. }));
        assert!(for_a.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_audit_in_state_order() {
        let gate = std::sync::Arc::new(ConsentGate::new());
        let mut tasks = Vec::new();
        for n in 0..40 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                if n % 2 == 0 {
                    gate.suppress("race@x.com", &format!("r{n}")).await;
                } else {
                    gate.record_consent("race@x.com", Channel::Email, &format!("p{n}"))
                        .await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let last_suppression = gate
            .audit_for("race@x.com")
            .await
            .into_iter()
            .rev()
            .find_map(|entry| match entry.action {
                AuditAction::Suppressed { reason } => Some(reason),
                _ => None,
            })
            .expect("suppression audited");
        assert_eq!(
            gate.state("race@x.com").await,
            ConsentState::Suppressed {
                reason: last_suppression
            }
        );
        assert!(!gate.opt_in_mode());
    }
}
