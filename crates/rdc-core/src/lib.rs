//! Core opportunity model, dedup keys, and expected-value scoring for RDC.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Outbound contact channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Handle,
    PlatformId,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Email,
        Channel::Sms,
        Channel::Handle,
        Channel::PlatformId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Handle => "handle",
            Channel::PlatformId => "platform_id",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination class an outbound call is charged against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Email,
    Sms,
    Platform(String),
}

impl Destination {
    pub fn platform(name: &str) -> Self {
        Destination::Platform(name.trim().to_ascii_lowercase())
    }

    /// Stable key used for breaker state, governor classes, and endpoint lookup.
    pub fn class_key(&self) -> String {
        match self {
            Destination::Email => "email".to_string(),
            Destination::Sms => "sms".to_string(),
            Destination::Platform(name) => format!("platform:{name}"),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class_key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDescriptor {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub platform_id: Option<String>,
}

impl ContactDescriptor {
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::Handle => self.handle.as_deref(),
            Channel::PlatformId => self.platform_id.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        Channel::ALL.iter().all(|c| self.address_for(*c).is_none())
    }
}

/// Raw handoff record from the discovery collaborator. Every field is optional so a
/// batch decodes even when individual records are incomplete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub win_probability: Option<f64>,
    #[serde(default)]
    pub cogs_estimate: Option<f64>,
    #[serde(default)]
    pub freshness_minutes: Option<f64>,
    #[serde(default)]
    pub contact: ContactDescriptor,
    #[serde(default)]
    pub channel_preference: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// Validated opportunity. Produced only through `TryFrom<OpportunityDraft>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub platform: String,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub title: String,
    pub value: f64,
    pub win_probability: f64,
    pub cogs_estimate: f64,
    pub freshness_minutes: f64,
    pub contact: ContactDescriptor,
    pub channel_preference: Vec<Channel>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn checked(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}

impl TryFrom<OpportunityDraft> for Opportunity {
    type Error = ValidationError;

    fn try_from(draft: OpportunityDraft) -> Result<Self, Self::Error> {
        let platform = non_blank(draft.platform).ok_or(ValidationError::Missing("platform"))?;
        let external_id = non_blank(draft.external_id);
        let url = non_blank(draft.url);
        if external_id.is_none() && url.is_none() {
            return Err(ValidationError::Missing("external_id or url"));
        }
        let title = non_blank(draft.title).ok_or(ValidationError::Missing("title"))?;
        let value = checked(
            "value",
            draft.value.ok_or(ValidationError::Missing("value"))?,
            0.0,
            f64::MAX,
        )?;
        let win_probability = checked(
            "win_probability",
            draft
                .win_probability
                .ok_or(ValidationError::Missing("win_probability"))?,
            0.0,
            1.0,
        )?;
        let cogs_estimate = checked(
            "cogs_estimate",
            draft.cogs_estimate.unwrap_or(0.0),
            0.0,
            f64::MAX,
        )?;
        let freshness_minutes = checked(
            "freshness_minutes",
            draft.freshness_minutes.unwrap_or(0.0),
            0.0,
            f64::MAX,
        )?;

        Ok(Self {
            platform,
            external_id,
            url,
            title,
            value,
            win_probability,
            cogs_estimate,
            freshness_minutes,
            contact: draft.contact,
            channel_preference: draft.channel_preference,
        })
    }
}

/// A resolved outbound target for one opportunity on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactTarget {
    pub channel: Channel,
    pub destination: Destination,
    pub address: String,
}

impl Opportunity {
    pub fn identifier(&self) -> &str {
        self.external_id
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or_default()
    }

    pub fn destination_for(&self, channel: Channel) -> Destination {
        match channel {
            Channel::Email => Destination::Email,
            Channel::Sms => Destination::Sms,
            Channel::Handle | Channel::PlatformId => Destination::platform(&self.platform),
        }
    }

    /// Present channels, preferred ones first, then the rest in canonical order.
    pub fn contact_targets(&self) -> Vec<ContactTarget> {
        let mut order: Vec<Channel> = Vec::with_capacity(Channel::ALL.len());
        for channel in self.channel_preference.iter().chain(Channel::ALL.iter()) {
            if !order.contains(channel) {
                order.push(*channel);
            }
        }
        order
            .into_iter()
            .filter_map(|channel| {
                self.contact.address_for(channel).map(|address| ContactTarget {
                    channel,
                    destination: self.destination_for(channel),
                    address: address.to_string(),
                })
            })
            .collect()
    }
}

fn key_fragment(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Fixed-length dedup key over platform, identifier (id, else url), and title.
pub fn compute_key(opportunity: &Opportunity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_fragment(&opportunity.platform).as_bytes());
    hasher.update([0x1f]);
    hasher.update(key_fragment(opportunity.identifier()).as_bytes());
    hasher.update([0x1f]);
    hasher.update(key_fragment(&opportunity.title).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn time_decay(freshness_minutes: f64) -> f64 {
    if freshness_minutes <= 30.0 {
        1.0
    } else if freshness_minutes <= 120.0 {
        0.9
    } else if freshness_minutes <= 1440.0 {
        0.7
    } else {
        0.5
    }
}

/// Expected value: `value × win_probability × decay − cogs`, floored at zero.
pub fn compute_ev(opportunity: &Opportunity) -> f64 {
    let raw = opportunity.value * opportunity.win_probability
        * time_decay(opportunity.freshness_minutes)
        - opportunity.cogs_estimate;
    raw.max(0.0)
}

/// Opportunity annotated once with its key, EV, and 1-based rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedOpportunity {
    pub key: String,
    pub ev: f64,
    pub rank: usize,
    pub opportunity: Opportunity,
}
