//! Candidate identity and terminal outcome records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Timestamp format used in candidate ids (day-hour-minute-second-millis).
pub const TIMESTAMP_FORMAT: &str = "%d-%H-%M-%S-%3f";

/// Opaque candidate identifier: `{origin_node}-{index}-{timestamp}`.
///
/// `index` is the batch position for setup candidates and the worker id for
/// candidates produced during tournament evolution. Uniqueness is
/// probabilistic; nothing coordinates id allocation across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateId {
    origin_node: usize,
    index: usize,
    timestamp: String,
}

/// Errors produced when parsing a candidate id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateIdError {
    #[error("Candidate id '{0}' must have the form <node>-<index>-<timestamp>")]
    Malformed(String),
    #[error("Candidate id '{0}' has a non-numeric node or index")]
    NotNumeric(String),
}

impl CandidateId {
    /// Create an id from its parts.
    pub fn new(origin_node: usize, index: usize, timestamp: impl Into<String>) -> Self {
        Self {
            origin_node,
            index,
            timestamp: timestamp.into(),
        }
    }

    /// Create an id stamped with the current local time.
    pub fn stamped(origin_node: usize, index: usize) -> Self {
        Self::new(origin_node, index, current_timestamp())
    }

    /// Node that created this candidate.
    pub fn origin_node(&self) -> usize {
        self.origin_node
    }

    /// Batch index or worker id.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Creation timestamp.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Ordering key for "earliest created" among near-duplicates.
    pub fn creation_key(&self) -> (usize, usize) {
        (self.origin_node, self.index)
    }

    /// Creation order: `(origin_node, index)` numerically, then the full id.
    pub fn creation_cmp(&self, other: &CandidateId) -> std::cmp::Ordering {
        self.creation_key()
            .cmp(&other.creation_key())
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn current_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.origin_node, self.index, self.timestamp)
    }
}

impl FromStr for CandidateId {
    type Err = CandidateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (Some(node), Some(index), Some(timestamp)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CandidateIdError::Malformed(s.to_string()));
        };
        if timestamp.is_empty() {
            return Err(CandidateIdError::Malformed(s.to_string()));
        }

        let origin_node = node
            .parse()
            .map_err(|_| CandidateIdError::NotNumeric(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| CandidateIdError::NotNumeric(s.to_string()))?;

        Ok(Self::new(origin_node, index, timestamp))
    }
}

impl TryFrom<String> for CandidateId {
    type Error = CandidateIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CandidateId> for String {
    fn from(id: CandidateId) -> Self {
        id.to_string()
    }
}

/// Success record for an evaluated candidate.
///
/// Written once by the worker that evaluated the candidate and never
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Candidate this record belongs to.
    pub id: CandidateId,
    /// Fitness reported by the evaluator.
    pub reward: f64,
    /// Wall-clock evaluation time in seconds.
    pub train_time: f64,
    /// Ancestry from the founding candidate down to `id` (inclusive).
    #[serde(with = "lineage_path")]
    pub lineage: Vec<CandidateId>,
}

impl Metadata {
    /// Record for a founder of the population.
    pub fn root(id: CandidateId, reward: f64, train_time: f64) -> Self {
        Self {
            lineage: vec![id.clone()],
            id,
            reward,
            train_time,
        }
    }

    /// Record for a child; its lineage extends the parent's.
    pub fn child_of(parent: &Metadata, id: CandidateId, reward: f64, train_time: f64) -> Self {
        let mut lineage = parent.lineage.clone();
        lineage.push(id.clone());
        Self {
            id,
            reward,
            train_time,
            lineage,
        }
    }

    /// Immediate parent, if any.
    pub fn parent_id(&self) -> Option<&CandidateId> {
        let len = self.lineage.len();
        if len < 2 {
            None
        } else {
            self.lineage.get(len - 2)
        }
    }
}

/// Failure record for a candidate whose evaluation did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetadata {
    /// Candidate this record belongs to.
    pub id: CandidateId,
    /// Node whose worker recorded the failure.
    pub node_id: usize,
    /// Worker that recorded the failure.
    #[serde(default)]
    pub worker_id: Option<usize>,
    /// Human-readable failure description.
    pub message: String,
}

/// Lineage is stored on disk as a `/`-joined id chain.
mod lineage_path {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::CandidateId;

    pub fn serialize<S>(lineage: &[CandidateId], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let joined = lineage
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/");
        serializer.serialize_str(&joined)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<CandidateId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let joined = String::deserialize(deserializer)?;
        joined
            .split('/')
            .map(|part| part.parse().map_err(D::Error::custom))
            .collect()
    }
}
