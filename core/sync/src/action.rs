//! Offline actions and their typed payloads.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use scoresync_common::{ActionId, ConflictId, DeviceId, Error, ResourceKey, Result};

/// Resource type of score records.
pub const SCORES: &str = "scores";
/// Resource type of evaluation records.
pub const EVALUATIONS: &str = "evaluations";

/// A judge's score for one competitor on one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMutation {
    pub score_id: String,
    pub competitor_id: String,
    pub criterion_id: String,
    pub judge_id: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// A judge's written evaluation of a competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMutation {
    pub evaluation_id: String,
    pub competitor_id: String,
    pub judge_id: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub completed: bool,
}

/// Closed set of mutations that can travel through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    ScoreUpsert(ScoreMutation),
    EvaluationUpsert(EvaluationMutation),
    RecordDelete {
        resource: ResourceKey,
    },
    /// Outcome of a conflict resolution, resubmitted as a whole record.
    ResolvedRecord {
        resource: ResourceKey,
        fields: Map<String, Value>,
        conflict_id: ConflictId,
    },
}

/// Discriminant of [`ActionPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ScoreUpsert,
    EvaluationUpsert,
    RecordDelete,
    ResolvedRecord,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::ScoreUpsert => "score_upsert",
            ActionKind::EvaluationUpsert => "evaluation_upsert",
            ActionKind::RecordDelete => "record_delete",
            ActionKind::ResolvedRecord => "resolved_record",
        };
        f.write_str(name)
    }
}

fn require_id(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", label)));
    }
    Ok(())
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::ScoreUpsert(_) => ActionKind::ScoreUpsert,
            ActionPayload::EvaluationUpsert(_) => ActionKind::EvaluationUpsert,
            ActionPayload::RecordDelete { .. } => ActionKind::RecordDelete,
            ActionPayload::ResolvedRecord { .. } => ActionKind::ResolvedRecord,
        }
    }

    /// The record this mutation targets.
    pub fn resource(&self) -> Result<ResourceKey> {
        match self {
            ActionPayload::ScoreUpsert(score) => ResourceKey::new(SCORES, &score.score_id),
            ActionPayload::EvaluationUpsert(eval) => {
                ResourceKey::new(EVALUATIONS, &eval.evaluation_id)
            }
            ActionPayload::RecordDelete { resource }
            | ActionPayload::ResolvedRecord { resource, .. } => Ok(resource.clone()),
        }
        .map_err(|e| Error::Validation(e.to_string()))
    }

    /// Field map the mutation writes. Empty for deletes.
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        let value = match self {
            ActionPayload::ScoreUpsert(score) => serde_json::to_value(score)?,
            ActionPayload::EvaluationUpsert(eval) => serde_json::to_value(eval)?,
            ActionPayload::RecordDelete { .. } => return Ok(Map::new()),
            ActionPayload::ResolvedRecord { fields, .. } => return Ok(fields.clone()),
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "payload did not render to an object: {}",
                other
            ))),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ActionPayload::RecordDelete { .. })
    }

    /// Reject payloads that are malformed regardless of domain rules.
    pub fn check_structure(&self) -> Result<()> {
        match self {
            ActionPayload::ScoreUpsert(score) => {
                require_id("score_id", &score.score_id)?;
                require_id("competitor_id", &score.competitor_id)?;
                require_id("criterion_id", &score.criterion_id)?;
                require_id("judge_id", &score.judge_id)?;
                if !score.value.is_finite() {
                    return Err(Error::Validation(format!(
                        "score value must be a finite number, got {}",
                        score.value
                    )));
                }
            }
            ActionPayload::EvaluationUpsert(eval) => {
                require_id("evaluation_id", &eval.evaluation_id)?;
                require_id("competitor_id", &eval.competitor_id)?;
                require_id("judge_id", &eval.judge_id)?;
            }
            ActionPayload::RecordDelete { .. } => {}
            ActionPayload::ResolvedRecord { fields, .. } => {
                if fields.is_empty() {
                    return Err(Error::Validation(
                        "resolved record must carry at least one field".to_string(),
                    ));
                }
            }
        }
        self.resource().map(|_| ())
    }
}

/// Lifecycle of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for the next drain (possibly after a backoff).
    Pending,
    /// Currently submitted to the authority.
    Syncing,
    /// Accepted by the authority.
    Synced,
    /// Retries exhausted or rejected outright. Kept until a human acts.
    Failed,
    /// Parked behind an open conflict.
    Conflict,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Synced => "synced",
            ActionStatus::Failed => "failed",
            ActionStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation awaiting confirmation by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: ActionPayload,
    pub resource: ResourceKey,
    pub created_at: DateTime<Utc>,
    /// Store-wide enqueue counter, breaks `created_at` ties.
    pub sequence: u64,
    pub device_id: DeviceId,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Explicit concurrency token; overrides the record's `last_modified`.
    pub version_token: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub conflict_id: Option<ConflictId>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineAction {
    /// Create a pending action.
    pub fn new(
        payload: ActionPayload,
        device_id: DeviceId,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let resource = payload.resource()?;
        Ok(Self {
            id: ActionId::generate(),
            kind: payload.kind(),
            payload,
            resource,
            created_at: now,
            sequence,
            device_id,
            status: ActionStatus::Pending,
            retry_count: 0,
            last_error: None,
            version_token: None,
            next_attempt_at: None,
            conflict_id: None,
            updated_at: now,
        })
    }

    /// Sort key preserving enqueue order.
    pub fn fifo_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }

    /// Pending and past any backoff.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Not yet settled with the authority and not parked behind a conflict.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            ActionStatus::Pending | ActionStatus::Syncing | ActionStatus::Failed
        )
    }

    pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
        self.status = ActionStatus::Syncing;
        self.updated_at = now;
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.status = ActionStatus::Synced;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// Record a transient failure. With `retry_in` the action goes back to
    /// pending after the delay, without it retries are exhausted.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        retry_in: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
        match retry_in {
            Some(delay) => {
                self.status = ActionStatus::Pending;
                let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
                self.next_attempt_at = Some(now + delay);
            }
            None => {
                self.status = ActionStatus::Failed;
                self.next_attempt_at = None;
            }
        }
    }

    /// Record a permanent rejection.
    pub fn mark_rejected(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.status = ActionStatus::Failed;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    pub fn mark_conflict(&mut self, conflict_id: ConflictId, now: DateTime<Utc>) {
        self.status = ActionStatus::Conflict;
        self.conflict_id = Some(conflict_id);
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// Undo `mark_syncing` after cancellation or a crash.
    pub fn revert_to_pending(&mut self, now: DateTime<Utc>) {
        if self.status == ActionStatus::Syncing {
            self.status = ActionStatus::Pending;
            self.updated_at = now;
        }
    }

    /// Give a failed action a fresh set of attempts.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = ActionStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.updated_at = now;
    }
}
