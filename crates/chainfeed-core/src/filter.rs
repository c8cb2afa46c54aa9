//! Log filter criteria and matching.
//!
//! [`FilterCriteria`] is the `eth_newFilter` / `eth_getLogs` / `logs`
//! subscription argument. Matching follows the Ethereum JSON-RPC rules:
//!
//! - block bounds only apply when they name a concrete height
//! - an empty address list matches any emitter
//! - `topics[i]` is a set of alternatives for position `i`; an empty set
//!   (JSON `null`) is a wildcard
//! - a log with fewer topics than the criteria has positions never matches

use alloy_primitives::{Address, Bloom, BloomInput, B256, U64};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::LogRecord;

/// Maximum number of topic positions a log can carry.
pub const MAX_TOPICS: usize = 4;

// ─── BlockNumber ──────────────────────────────────────────────────────────────

/// A block reference as accepted in filter criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockNumber {
    Number(u64),
    Earliest,
    Latest,
    Pending,
    Safe,
    Finalized,
}

impl BlockNumber {
    /// The concrete height this reference names, if any.
    ///
    /// `earliest` is height 0; the other tags are relative to the chain head
    /// and return `None`.
    pub fn explicit(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Earliest => Some(0),
            _ => None,
        }
    }

    /// Resolve against the current head height.
    pub fn resolve(&self, head: u64) -> u64 {
        self.explicit().unwrap_or(head)
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n:#x}"),
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
            Self::Pending => write!(f, "pending"),
            Self::Safe => write!(f, "safe"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

impl std::str::FromStr for BlockNumber {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            "pending" => Ok(Self::Pending),
            "safe" => Ok(Self::Safe),
            "finalized" => Ok(Self::Finalized),
            hex => {
                let digits = hex
                    .strip_prefix("0x")
                    .ok_or_else(|| CoreError::InvalidCriteria(format!("invalid block number {hex}")))?;
                u64::from_str_radix(digits, 16)
                    .map(Self::Number)
                    .map_err(|_| CoreError::InvalidCriteria(format!("invalid block number {hex}")))
            }
        }
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => U64::from(*n).serialize(serializer),
            tag => serializer.collect_str(tag),
        }
    }
}

impl<'de> Deserialize<'de> for BlockNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Number(n)),
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

// ─── FilterCriteria ───────────────────────────────────────────────────────────

/// Log selection criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_block: Option<BlockNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<BlockNumber>,
    /// Restrict to a single block. Excludes `from_block` / `to_block`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<B256>,
    /// Emitting contracts; empty matches any.
    #[serde(
        default,
        rename = "address",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub addresses: Vec<Address>,
    /// Per-position topic alternatives; an empty set is a wildcard.
    #[serde(
        default,
        deserialize_with = "topic_sets",
        serialize_with = "serialize_topic_sets",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub topics: Vec<Vec<B256>>,
}

impl FilterCriteria {
    /// Parse criteria from a raw JSON-RPC parameter.
    ///
    /// `null` yields the match-everything criteria.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(CoreError::InvalidCriteria("criteria must be an object".into()));
        }
        serde_json::from_value(value).map_err(|e| CoreError::InvalidCriteria(e.to_string()))
    }

    /// Builder-style: only logs from `address`.
    pub fn address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Builder-style: alternatives for the next topic position.
    pub fn topic(mut self, alternatives: impl IntoIterator<Item = B256>) -> Self {
        self.topics.push(alternatives.into_iter().collect());
        self
    }

    /// Builder-style: explicit block range.
    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.from_block = Some(BlockNumber::Number(from));
        self.to_block = Some(BlockNumber::Number(to));
        self
    }

    /// Reject criteria that can never be served.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.block_hash.is_some() && (self.from_block.is_some() || self.to_block.is_some()) {
            return Err(CoreError::InvalidCriteria(
                "cannot specify both blockHash and fromBlock/toBlock".into(),
            ));
        }
        if self.topics.len() > MAX_TOPICS {
            return Err(CoreError::InvalidCriteria(format!(
                "exceeds max topics ({} > {MAX_TOPICS})",
                self.topics.len()
            )));
        }
        let from = self.from_block.and_then(|b| b.explicit());
        let to = self.to_block.and_then(|b| b.explicit());
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(CoreError::InvalidBlockRange { from, to });
            }
        }
        Ok(())
    }

    /// Returns `true` if `log` satisfies every criterion.
    pub fn matches(&self, log: &LogRecord) -> bool {
        if let Some(from) = self.from_block.and_then(|b| b.explicit()) {
            if log.block_number < from {
                return false;
            }
        }
        if let Some(to) = self.to_block.and_then(|b| b.explicit()) {
            if log.block_number > to {
                return false;
            }
        }
        self.matches_address_and_topics(log)
    }

    /// Address and topic checks only, ignoring the block range.
    pub fn matches_address_and_topics(&self, log: &LogRecord) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        if self.topics.len() > log.topics.len() {
            return false;
        }
        self.topics
            .iter()
            .zip(&log.topics)
            .all(|(set, topic)| set.is_empty() || set.contains(topic))
    }

    /// Returns `false` only if `bloom` proves no log in the block can match.
    pub fn bloom_matches(&self, bloom: &Bloom) -> bool {
        if !self.addresses.is_empty()
            && !self
                .addresses
                .iter()
                .any(|a| bloom.contains_input(BloomInput::Raw(a.as_slice())))
        {
            return false;
        }
        self.topics.iter().all(|set| {
            set.is_empty()
                || set
                    .iter()
                    .any(|t| bloom.contains_input(BloomInput::Raw(t.as_slice())))
        })
    }
}

/// Keep the logs that satisfy `criteria`, preserving order.
pub fn filter_logs<I>(logs: I, criteria: &FilterCriteria) -> Vec<LogRecord>
where
    I: IntoIterator<Item = LogRecord>,
{
    logs.into_iter().filter(|log| criteria.matches(log)).collect()
}

// ─── serde helpers ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Address>, D::Error> {
    Ok(Option::<OneOrMany<Address>>::deserialize(deserializer)?
        .map(OneOrMany::into_vec)
        .unwrap_or_default())
}

fn topic_sets<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<B256>>, D::Error> {
    let raw = Option::<Vec<Option<OneOrMany<B256>>>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|set| set.map(OneOrMany::into_vec).unwrap_or_default())
        .collect())
}

fn serialize_topic_sets<S: Serializer>(topics: &[Vec<B256>], serializer: S) -> Result<S::Ok, S::Error> {
    let sets: Vec<Option<&Vec<B256>>> = topics
        .iter()
        .map(|set| if set.is_empty() { None } else { Some(set) })
        .collect();
    sets.serialize(serializer)
}
