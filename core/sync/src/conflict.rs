//! Conflict detection records and resolution strategies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use scoresync_common::{ActionId, ConflictId, Error, ResourceKey, Result};
use scoresync_store::{decode, encode, DurableStore, IndexFilter, Table, WriteBatch};

use crate::action::OfflineAction;
use crate::queue::ActionQueue;

const MAX_SWAP_ATTEMPTS: u32 = 32;

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the authority's version, requeue nothing.
    ServerWins,
    /// Overwrite the authority with the client's version.
    ClientWins,
    /// Later timestamp wins; ties go to the authority.
    LastWriteWins,
    /// Field-level union against the last acknowledged state.
    Merge,
    /// Caller-supplied record.
    ManualResolution,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::ClientWins => "client_wins",
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::ManualResolution => "manual_resolution",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server_wins" => Ok(ResolutionStrategy::ServerWins),
            "client_wins" => Ok(ResolutionStrategy::ClientWins),
            "last_write_wins" => Ok(ResolutionStrategy::LastWriteWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual_resolution" | "manual" => Ok(ResolutionStrategy::ManualResolution),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Detected,
    DivergenceMerged,
    Resolved,
}

/// One line of a conflict's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
    pub detail: String,
}

/// A rejected write next to the authority's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub server_fields: Map<String, Value>,
    pub server_last_modified: DateTime<Utc>,
    pub client_fields: Map<String, Value>,
    /// Last state both sides agreed on, if known.
    pub base: Option<Map<String, Value>>,
}

/// A detected divergence between the local and authoritative record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub resource: ResourceKey,
    pub server_data: Map<String, Value>,
    pub client_data: Map<String, Value>,
    pub base_data: Option<Map<String, Value>>,
    pub server_last_modified: DateTime<Utc>,
    pub client_modified_at: DateTime<Utc>,
    pub conflict_fields: Vec<String>,
    pub strategy: Option<ResolutionStrategy>,
    pub resolved_data: Option<Map<String, Value>>,
    pub notes: Option<String>,
    pub state: ConflictState,
    /// Actions parked behind this conflict, oldest first.
    pub action_ids: Vec<ActionId>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Action resubmitting the resolution, if any.
    pub resolution_action: Option<ActionId>,
    pub audit: Vec<AuditEntry>,
}

/// Keys whose values differ between two records, sorted.
pub fn differing_fields(a: &Map<String, Value>, b: &Map<String, Value>) -> Vec<String> {
    a.keys()
        .chain(b.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| !same_field(a.get(*key), b.get(*key)))
        .cloned()
        .collect()
}

fn same_field(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => same_value(a, b),
        (a, b) => a.is_none() && b.is_none(),
    }
}

/// JSON equality where numbers compare by value, so `8` equals `8.0`.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| same_value(x, y))
        }
        (Value::Object(x), Value::Object(y)) => differing_fields(x, y).is_empty(),
        _ => a == b,
    }
}

impl Conflict {
    /// Open a conflict for an action the authority rejected.
    pub fn detect(action: &OfflineAction, divergence: Divergence, now: DateTime<Utc>) -> Self {
        let conflict_fields = differing_fields(&divergence.server_fields, &divergence.client_fields);
        let detail = format!(
            "{} rejected, fields differ: {}",
            action.id,
            conflict_fields.join(", ")
        );
        Self {
            id: ConflictId::generate(),
            resource: action.resource.clone(),
            server_data: divergence.server_fields,
            client_data: divergence.client_fields,
            base_data: divergence.base,
            server_last_modified: divergence.server_last_modified,
            client_modified_at: action.created_at,
            conflict_fields,
            strategy: None,
            resolved_data: None,
            notes: None,
            state: ConflictState::Open,
            action_ids: vec![action.id.clone()],
            detected_at: now,
            resolved_at: None,
            resolution_action: None,
            audit: vec![AuditEntry {
                at: now,
                event: AuditEvent::Detected,
                detail,
            }],
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConflictState::Open
    }

    /// Fold a further divergence on the same resource into this conflict.
    /// The newest client state and authority state replace the old ones.
    pub fn merge_divergence(
        &mut self,
        action: &OfflineAction,
        divergence: Divergence,
        now: DateTime<Utc>,
    ) {
        if divergence.server_last_modified >= self.server_last_modified {
            self.server_data = divergence.server_fields;
            self.server_last_modified = divergence.server_last_modified;
        }
        self.client_data = divergence.client_fields;
        self.client_modified_at = self.client_modified_at.max(action.created_at);
        if self.base_data.is_none() {
            self.base_data = divergence.base;
        }
        self.conflict_fields = differing_fields(&self.server_data, &self.client_data);
        if !self.action_ids.contains(&action.id) {
            self.action_ids.push(action.id.clone());
        }
        self.audit.push(AuditEntry {
            at: now,
            event: AuditEvent::DivergenceMerged,
            detail: format!("{} folded in", action.id),
        });
    }

    /// Mark resolved.
    pub fn close(
        &mut self,
        resolution: &Resolution,
        resolution_action: Option<ActionId>,
        now: DateTime<Utc>,
    ) {
        self.state = ConflictState::Resolved;
        self.strategy = Some(resolution.strategy);
        self.resolved_data = Some(resolution.data.clone());
        self.notes = resolution.notes.clone();
        self.resolved_at = Some(now);
        self.audit.push(AuditEntry {
            at: now,
            event: AuditEvent::Resolved,
            detail: match &resolution_action {
                Some(id) => format!("{} via {}", resolution.strategy, id),
                None => resolution.strategy.to_string(),
            },
        });
        self.resolution_action = resolution_action;
    }
}

/// Outcome of applying a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// Final record.
    pub data: Map<String, Value>,
    /// Whether `data` must be resubmitted to the authority.
    pub requeue: bool,
    pub notes: Option<String>,
}

fn is_default(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
    }
}

/// Pure strategy application.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Whether the client side wins a timestamp comparison. Ties go to the
    /// authority.
    pub fn client_is_later(conflict: &Conflict) -> bool {
        conflict.client_modified_at > conflict.server_last_modified
    }

    /// Apply `strategy` to `conflict`.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if manual resolution lacks data, or data is
    ///   supplied for another strategy
    pub fn resolve(
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        data: Option<Map<String, Value>>,
        notes: Option<String>,
    ) -> Result<Resolution> {
        if data.is_some() && strategy != ResolutionStrategy::ManualResolution {
            return Err(Error::InvalidInput(format!(
                "{} does not take resolved data",
                strategy
            )));
        }

        let data = match strategy {
            ResolutionStrategy::ServerWins => conflict.server_data.clone(),
            ResolutionStrategy::ClientWins => conflict.client_data.clone(),
            ResolutionStrategy::LastWriteWins => {
                if Self::client_is_later(conflict) {
                    conflict.client_data.clone()
                } else {
                    conflict.server_data.clone()
                }
            }
            ResolutionStrategy::Merge => Self::merge(conflict),
            ResolutionStrategy::ManualResolution => match data {
                Some(data) if !data.is_empty() => data,
                _ => {
                    return Err(Error::InvalidInput(
                        "manual resolution needs a non-empty record".to_string(),
                    ))
                }
            },
        };

        let requeue = strategy != ResolutionStrategy::ServerWins
            && !differing_fields(&data, &conflict.server_data).is_empty();
        Ok(Resolution {
            strategy,
            data,
            requeue,
            notes,
        })
    }

    /// Field-level merge.
    ///
    /// A field changed on one side only takes that side's value. A field
    /// changed on both sides (or without a known base, non-default on both)
    /// falls back to last-write-wins for that field.
    pub fn merge(conflict: &Conflict) -> Map<String, Value> {
        let client_later = Self::client_is_later(conflict);
        let mut merged = conflict.server_data.clone();

        for field in &conflict.conflict_fields {
            let server = conflict.server_data.get(field);
            let client = conflict.client_data.get(field);

            let take_client = match &conflict.base_data {
                Some(base) => {
                    let base = base.get(field);
                    let client_changed = !same_field(client, base);
                    let server_changed = !same_field(server, base);
                    match (client_changed, server_changed) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => client_later,
                    }
                }
                None => match (is_default(server), is_default(client)) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => client_later,
                },
            };

            if take_client {
                match client {
                    Some(value) => {
                        merged.insert(field.clone(), value.clone());
                    }
                    None => {
                        merged.remove(field);
                    }
                }
            }
        }
        merged
    }
}

/// Conflict records in the durable store.
///
/// A `meta` index entry per resource keeps at most one conflict open for it.
#[derive(Clone)]
pub struct ConflictStore {
    store: Arc<dyn DurableStore>,
}

fn index_key(resource: &ResourceKey) -> String {
    format!("open_conflict/{}", resource.storage_key())
}

impl ConflictStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        self.get_raw(id).await?.map(decode).transpose()
    }

    pub async fn get_raw(&self, id: &ConflictId) -> Result<Option<Value>> {
        self.store.get(Table::Conflicts, id.as_str()).await
    }

    /// Open conflicts, oldest first.
    pub async fn list_open(&self) -> Result<Vec<Conflict>> {
        let mut open = self
            .store
            .get_all(Table::Conflicts, Some(IndexFilter::field("state", "open")))
            .await?
            .into_iter()
            .map(|row| decode::<Conflict>(row.value))
            .collect::<Result<Vec<_>>>()?;
        open.sort_by_key(|c| c.detected_at);
        Ok(open)
    }

    /// The open conflict for a resource.
    pub async fn find_open(&self, resource: &ResourceKey) -> Result<Option<Conflict>> {
        match self.store.get(Table::Meta, &index_key(resource)).await? {
            Some(Value::String(id)) => self.get(&ConflictId::new(id)?).await,
            _ => Ok(None),
        }
    }

    /// Record a rejected action: open a conflict for its resource, or fold
    /// the divergence into the one already open. The action is parked in the
    /// same atomic write.
    pub async fn open_or_merge(
        &self,
        action: &OfflineAction,
        divergence: Divergence,
    ) -> Result<Conflict> {
        let index = index_key(&action.resource);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = Utc::now();
            let action_raw = self
                .store
                .get(Table::Actions, action.id.as_str())
                .await?
                .ok_or_else(|| Error::NotFound(format!("action {}", action.id)))?;
            let current: OfflineAction = decode(action_raw)?;
            let index_raw = self.store.get(Table::Meta, &index).await?;

            let existing = match &index_raw {
                Some(Value::String(id)) => {
                    let id = ConflictId::new(id.clone())?;
                    self.get_raw(&id).await?.map(|raw| (id, raw))
                }
                _ => None,
            };

            let (conflict, batch, created) = match existing {
                Some((id, raw)) => {
                    let mut conflict: Conflict = decode(raw.clone())?;
                    conflict.merge_divergence(&current, divergence.clone(), now);
                    let batch = WriteBatch::new()
                        .expect(Table::Meta, index.clone(), index_raw.clone())
                        .expect(Table::Conflicts, id.as_str(), Some(raw))
                        .put(Table::Conflicts, id.as_str(), encode(&conflict)?);
                    (conflict, batch, false)
                }
                None => {
                    let conflict = Conflict::detect(&current, divergence.clone(), now);
                    let batch = WriteBatch::new()
                        .expect(Table::Meta, index.clone(), index_raw.clone())
                        .put(
                            Table::Meta,
                            index.clone(),
                            Value::String(conflict.id.as_str().to_string()),
                        )
                        .put(Table::Conflicts, conflict.id.as_str(), encode(&conflict)?);
                    (conflict, batch, true)
                }
            };

            let mut parked = current.clone();
            parked.mark_conflict(conflict.id.clone(), now);
            let batch = ActionQueue::stage(batch, &current, &parked)?;

            if self.store.apply(batch).await? {
                if created {
                    info!(
                        "Conflict {} opened for {} on fields [{}]",
                        conflict.id,
                        conflict.resource,
                        conflict.conflict_fields.join(", ")
                    );
                } else {
                    debug!("Action {} folded into conflict {}", action.id, conflict.id);
                }
                return Ok(conflict);
            }
        }

        Err(Error::Conflict(format!(
            "could not record conflict for {}",
            action.resource
        )))
    }

    /// Add the writes closing `conflict` to a batch. `previous` is the
    /// stored document the close is based on.
    pub fn stage_close(
        batch: WriteBatch,
        previous: Value,
        closed: &Conflict,
    ) -> Result<WriteBatch> {
        let index = index_key(&closed.resource);
        Ok(batch
            .expect(Table::Conflicts, closed.id.as_str(), Some(previous))
            .put(Table::Conflicts, closed.id.as_str(), encode(closed)?)
            .expect(
                Table::Meta,
                index.clone(),
                Some(Value::String(closed.id.as_str().to_string())),
            )
            .delete(Table::Meta, index))
    }

    /// Delete resolved conflicts past the retention window.
    pub async fn prune_resolved(&self, retention: Duration) -> Result<usize> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::zero());
        let resolved = self
            .store
            .get_all(Table::Conflicts, Some(IndexFilter::field("state", "resolved")))
            .await?;

        let mut pruned = 0;
        for row in resolved {
            let conflict: Conflict = decode(row.value)?;
            if conflict.resolved_at.is_some_and(|at| at <= cutoff) {
                self.store.delete(Table::Conflicts, &row.key).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionPayload, EvaluationMutation};
    use scoresync_common::{DeviceId, RetryConfig};
    use scoresync_store::MemoryStore;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn conflict(
        server: Value,
        client: Value,
        base: Option<Value>,
        server_at: DateTime<Utc>,
        client_at: DateTime<Utc>,
    ) -> Conflict {
        let server = map(server);
        let client = map(client);
        Conflict {
            id: ConflictId::generate(),
            resource: ResourceKey::parse("evaluations/e-1").unwrap(),
            conflict_fields: differing_fields(&server, &client),
            server_data: server,
            client_data: client,
            base_data: base.map(map),
            server_last_modified: server_at,
            client_modified_at: client_at,
            strategy: None,
            resolved_data: None,
            notes: None,
            state: ConflictState::Open,
            action_ids: Vec::new(),
            detected_at: server_at,
            resolved_at: None,
            resolution_action: None,
            audit: Vec::new(),
        }
    }

    #[test]
    fn test_differing_fields() {
        let fields = differing_fields(
            &map(json!({"a": 1, "b": 2, "c": 3})),
            &map(json!({"a": 1, "b": 5, "d": 4})),
        );
        assert_eq!(fields, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let fields = differing_fields(
            &map(json!({"value": 8, "scores": [1, 2.5], "meta": {"round": 2}})),
            &map(json!({"value": 8.0, "scores": [1.0, 2.5], "meta": {"round": 2.0}})),
        );
        assert!(fields.is_empty());
        assert!(!same_value(&json!(8), &json!(8.5)));
        assert!(!same_value(&json!(8), &json!("8")));
    }

    #[test]
    fn test_merge_takes_each_sides_change() {
        let t = Utc::now();
        let c = conflict(
            json!({"comments": "old", "completed": true}),
            json!({"comments": "great form", "completed": false}),
            Some(json!({"comments": "old", "completed": false})),
            t,
            t,
        );
        let resolution = ConflictResolver::resolve(&c, ResolutionStrategy::Merge, None, None).unwrap();
        assert_eq!(
            resolution.data,
            map(json!({"comments": "great form", "completed": true}))
        );
        assert!(resolution.requeue);
    }

    #[test]
    fn test_merge_both_changed_falls_back_to_timestamps() {
        let t = Utc::now();
        let base = Some(json!({"comments": "a"}));
        let later_client = conflict(
            json!({"comments": "server"}),
            json!({"comments": "client"}),
            base.clone(),
            t,
            t + ChronoDuration::seconds(1),
        );
        assert_eq!(ConflictResolver::merge(&later_client)["comments"], "client");

        let tie = conflict(json!({"comments": "server"}), json!({"comments": "client"}), base, t, t);
        assert_eq!(ConflictResolver::merge(&tie)["comments"], "server");
    }

    #[test]
    fn test_merge_without_base_prefers_non_default() {
        let t = Utc::now();
        let c = conflict(
            json!({"comments": "", "completed": true}),
            json!({"comments": "solid", "completed": false}),
            None,
            t,
            t,
        );
        let merged = ConflictResolver::merge(&c);
        assert_eq!(merged["comments"], "solid");
        assert_eq!(merged["completed"], true);
    }

    #[test]
    fn test_strategies() {
        let t = Utc::now();
        let c = conflict(json!({"v": 1}), json!({"v": 2}), None, t, t - ChronoDuration::seconds(5));

        let server = ConflictResolver::resolve(&c, ResolutionStrategy::ServerWins, None, None).unwrap();
        assert_eq!(server.data, c.server_data);
        assert!(!server.requeue);

        let client = ConflictResolver::resolve(&c, ResolutionStrategy::ClientWins, None, None).unwrap();
        assert_eq!(client.data, c.client_data);
        assert!(client.requeue);

        let lww = ConflictResolver::resolve(&c, ResolutionStrategy::LastWriteWins, None, None).unwrap();
        assert_eq!(lww.data, c.server_data);
        assert!(!lww.requeue);

        assert!(matches!(
            ConflictResolver::resolve(&c, ResolutionStrategy::ManualResolution, None, None),
            Err(Error::InvalidInput(_))
        ));
        let manual = ConflictResolver::resolve(
            &c,
            ResolutionStrategy::ManualResolution,
            Some(map(json!({"v": 3}))),
            Some("agreed with head judge".to_string()),
        )
        .unwrap();
        assert_eq!(manual.data["v"], 3);
        assert_eq!(manual.notes.as_deref(), Some("agreed with head judge"));
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [
            ResolutionStrategy::ServerWins,
            ResolutionStrategy::ClientWins,
            ResolutionStrategy::LastWriteWins,
            ResolutionStrategy::Merge,
            ResolutionStrategy::ManualResolution,
        ] {
            assert_eq!(strategy.as_str().parse::<ResolutionStrategy>().unwrap(), strategy);
        }
        assert!("newest".parse::<ResolutionStrategy>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_lww_tie_goes_to_server(secs in 0i64..4_000_000_000, a in 0u32..100, b in 0u32..100) {
            let t = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let c = conflict(json!({"v": a}), json!({"v": b}), None, t, t);
            let resolution = ConflictResolver::resolve(&c, ResolutionStrategy::LastWriteWins, None, None).unwrap();
            proptest::prop_assert_eq!(resolution.data, c.server_data.clone());
        }

        #[test]
        fn prop_resolution_is_deterministic(a in 0u32..10, b in 0u32..10, base in 0u32..10, skew in -5i64..5) {
            let t = Utc::now();
            let c = conflict(
                json!({"x": a, "y": b}),
                json!({"x": b, "y": a}),
                Some(json!({"x": base, "y": base})),
                t,
                t + ChronoDuration::seconds(skew),
            );
            for strategy in [ResolutionStrategy::Merge, ResolutionStrategy::LastWriteWins, ResolutionStrategy::ClientWins] {
                let first = ConflictResolver::resolve(&c, strategy, None, None).unwrap();
                let second = ConflictResolver::resolve(&c, strategy, None, None).unwrap();
                proptest::prop_assert_eq!(first, second);
            }
        }
    }

    async fn parked_action(queue: &ActionQueue, comments: &str) -> OfflineAction {
        queue
            .enqueue(ActionPayload::EvaluationUpsert(EvaluationMutation {
                evaluation_id: "e-1".to_string(),
                competitor_id: "c-1".to_string(),
                judge_id: "j-1".to_string(),
                comments: comments.to_string(),
                completed: false,
            }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_divergence_merges_into_open_conflict() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let queue = ActionQueue::new(store.clone(), DeviceId::new("d").unwrap(), RetryConfig::default());
        let conflicts = ConflictStore::new(store.clone());
        let first = parked_action(&queue, "one").await;
        let second = parked_action(&queue, "two").await;
        let server_at = Utc::now();

        let divergence = |action: &OfflineAction| Divergence {
            server_fields: map(json!({"comments": "server"})),
            server_last_modified: server_at,
            client_fields: action.payload.to_fields().unwrap(),
            base: None,
        };

        let opened = conflicts.open_or_merge(&first, divergence(&first)).await.unwrap();
        let merged = conflicts.open_or_merge(&second, divergence(&second)).await.unwrap();

        assert_eq!(opened.id, merged.id);
        assert_eq!(conflicts.list_open().await.unwrap().len(), 1);
        assert_eq!(merged.action_ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(merged.client_data["comments"], "two");
        assert_eq!(merged.audit.len(), 2);

        let parked = queue.list_for_conflict(&opened.id).await.unwrap();
        assert_eq!(parked.len(), 2);
        assert_eq!(
            conflicts
                .find_open(&first.resource)
                .await
                .unwrap()
                .map(|c| c.id),
            Some(opened.id)
        );
    }

    #[tokio::test]
    async fn test_close_removes_index_and_prunes() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let queue = ActionQueue::new(store.clone(), DeviceId::new("d").unwrap(), RetryConfig::default());
        let conflicts = ConflictStore::new(store.clone());
        let action = parked_action(&queue, "one").await;

        let opened = conflicts
            .open_or_merge(
                &action,
                Divergence {
                    server_fields: map(json!({"comments": "server"})),
                    server_last_modified: Utc::now(),
                    client_fields: action.payload.to_fields().unwrap(),
                    base: None,
                },
            )
            .await
            .unwrap();

        let raw = conflicts.get_raw(&opened.id).await.unwrap().unwrap();
        let resolution =
            ConflictResolver::resolve(&opened, ResolutionStrategy::ServerWins, None, None).unwrap();
        let mut closed = opened.clone();
        closed.close(&resolution, None, Utc::now());
        let batch = ConflictStore::stage_close(WriteBatch::new(), raw.clone(), &closed).unwrap();
        assert!(store.apply(batch).await.unwrap());

        assert!(conflicts.find_open(&action.resource).await.unwrap().is_none());
        assert!(conflicts.list_open().await.unwrap().is_empty());

        // A stale close is refused.
        let batch = ConflictStore::stage_close(WriteBatch::new(), raw, &closed).unwrap();
        assert!(!store.apply(batch).await.unwrap());

        assert_eq!(conflicts.prune_resolved(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(conflicts.prune_resolved(Duration::ZERO).await.unwrap(), 1);
    }
}
