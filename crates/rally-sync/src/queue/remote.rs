use async_trait::async_trait;
use rally_proto::{JobAction, Resource, SyncJob};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::RemoteError;
use crate::fetch::{HostedClient, SPORT_TYPE};

/// Result of applying one job remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The parent match has no remote row yet; try again later.
    RetryLater,
}

/// Applies jobs to the remote store.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    async fn write(&self, job: &SyncJob) -> Result<WriteOutcome, RemoteError>;

    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), RemoteError>;
}

/// Columns a match row accepts. Anything else in a match payload is dropped.
pub const MATCH_COLUMNS: &[&str] = &[
    "external_id",
    "game_n",
    "game_pin",
    "status",
    "connections",
    "connection_pins",
    "scheduled_at",
    "match_info",
    "officials",
    "team_a",
    "team_b",
    "home_team",
    "players_home",
    "bench_home",
    "team2_team",
    "players_team2",
    "bench_team2",
    "coin_toss",
    "results",
    "signatures",
    "approval",
    "test",
    "created_at",
    "updated_at",
    "manual_changes",
    "current_set",
    "set_results",
    "final_score",
    "sanctions",
    "winner",
    "sport_type",
];

/// Structured match columns that are shallow-merged on update.
pub const MERGED_COLUMNS: &[&str] = &[
    "connections",
    "connection_pins",
    "team_a",
    "team_b",
    "officials",
    "coin_toss",
    "set_results",
    "sanctions",
];

fn object(payload: &Value) -> Map<String, Value> {
    payload.as_object().cloned().unwrap_or_default()
}

/// Allow-listed match columns, stamped with the sport type.
pub fn filter_match_payload(payload: &Value) -> Value {
    let mut row: Map<String, Value> = object(payload)
        .into_iter()
        .filter(|(key, _)| MATCH_COLUMNS.contains(&key.as_str()))
        .collect();
    row.insert("sport_type".to_string(), Value::String(SPORT_TYPE.to_string()));
    Value::Object(row)
}

/// Shallow-merges `update` into `existing` for every merged column that the
/// update carries as an object. Other columns are taken from the update as-is.
pub fn merge_structured(existing: Option<&Map<String, Value>>, update: &mut Map<String, Value>) {
    let Some(existing) = existing else {
        return;
    };
    for column in MERGED_COLUMNS {
        let Some(Value::Object(partial)) = update.get(*column) else {
            continue;
        };
        let mut merged = existing
            .get(*column)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (key, value) in partial {
            merged.insert(key.clone(), value.clone());
        }
        update.insert((*column).to_string(), Value::Object(merged));
    }
}

fn missing(field: &str, job: &SyncJob) -> RemoteError {
    RemoteError::Rejected {
        code: None,
        message: format!("{} {} payload has no {field}", job.resource, job.action),
        details: None,
        hint: None,
    }
}

/// Writes jobs to the hosted REST service.
#[derive(Clone)]
pub struct RestWriter {
    client: HostedClient,
}

impl RestWriter {
    pub fn new(client: HostedClient) -> Self {
        Self { client }
    }

    async fn match_row_id(&self, external_id: &str) -> Result<Option<String>, RemoteError> {
        #[derive(Deserialize)]
        struct IdRow {
            id: String,
        }
        let row: Option<IdRow> = self
            .client
            .select_one("matches", "id", &[("external_id", external_id), ("sport_type", SPORT_TYPE)])
            .await?;
        Ok(row.map(|r| r.id))
    }

    /// Swaps an external `match_id` for the parent's internal row id.
    /// `None` means the parent is not synced yet.
    async fn with_parent(&self, payload: &Value) -> Result<Option<Value>, RemoteError> {
        let mut row = object(payload);
        if let Some(Value::String(external)) = row.get("match_id").cloned() {
            match self.match_row_id(&external).await? {
                Some(id) => {
                    row.insert("match_id".to_string(), Value::String(id));
                }
                None => return Ok(None),
            }
        }
        Ok(Some(Value::Object(row)))
    }

    /// Patches a period or event row addressed by its `external_id`.
    async fn update_child(&self, table: &str, job: &SyncJob) -> Result<(), RemoteError> {
        let mut update = object(&job.payload);
        let external_id = match update.remove("external_id") {
            Some(Value::String(id)) => id,
            _ => return Err(missing("external_id", job)),
        };
        self.client
            .update(table, &Value::Object(update), &[("external_id", external_id.as_str())])
            .await
    }

    async fn update_match(&self, job: &SyncJob) -> Result<(), RemoteError> {
        let mut update = object(&job.payload);
        let id = match update.remove("id").or_else(|| update.remove("external_id")) {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => return Err(missing("id", job)),
        };

        let columns: Vec<&str> = MERGED_COLUMNS
            .iter()
            .copied()
            .filter(|c| update.contains_key(*c))
            .collect();
        if !columns.is_empty() {
            let existing = self
                .client
                .select_one::<Map<String, Value>>(
                    "matches",
                    &columns.join(","),
                    &[("external_id", id.as_str()), ("sport_type", SPORT_TYPE)],
                )
                .await;
            match existing {
                Ok(existing) => merge_structured(existing.as_ref(), &mut update),
                Err(err) if err.is_unreachable() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        target = "rally.queue",
                        match_id = %id,
                        error = %err,
                        "could not read structured columns; writing update unmerged"
                    );
                }
            }
        }

        self.client
            .update(
                "matches",
                &Value::Object(update),
                &[("external_id", id.as_str()), ("sport_type", SPORT_TYPE)],
            )
            .await
    }
}

#[async_trait]
impl RemoteWriter for RestWriter {
    async fn write(&self, job: &SyncJob) -> Result<WriteOutcome, RemoteError> {
        match (job.resource, job.action) {
            (Resource::Match, JobAction::Insert) => {
                self.client
                    .upsert("matches", &filter_match_payload(&job.payload), "external_id")
                    .await?;
            }
            (Resource::Match, JobAction::Update) => self.update_match(job).await?,
            (Resource::Period, JobAction::Insert) => {
                let Some(row) = self.with_parent(&job.payload).await? else {
                    return Ok(WriteOutcome::RetryLater);
                };
                self.client.upsert("sets", &row, "external_id").await?;
            }
            (Resource::Period, JobAction::Update) => self.update_child("sets", job).await?,
            (Resource::Event, JobAction::Insert) => {
                let Some(row) = self.with_parent(&job.payload).await? else {
                    return Ok(WriteOutcome::RetryLater);
                };
                self.client.upsert("events", &row, "external_id").await?;
            }
            (Resource::Event, JobAction::Update) => self.update_child("events", job).await?,
        }
        Ok(WriteOutcome::Applied)
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.client.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_payload_is_filtered_and_stamped() {
        let row = filter_match_payload(&json!({
            "external_id": "M1",
            "status": "live",
            "legacyField": 3,
            "sport_type": "indoor"
        }));
        assert_eq!(row, json!({"external_id": "M1", "status": "live", "sport_type": "beach"}));
    }

    #[test]
    fn merged_columns_survive_insert_filtering() {
        let payload = Value::Object(MERGED_COLUMNS.iter().map(|c| (c.to_string(), json!({}))).collect());
        let row = filter_match_payload(&payload);
        for column in MERGED_COLUMNS {
            assert!(row.get(*column).is_some(), "{column} dropped on insert");
        }
    }

    #[test]
    fn structured_columns_merge_shallowly() {
        let existing = json!({
            "connections": {"referee": true, "scoreboard": false},
            "officials": ["not", "an", "object"]
        });
        let mut update = object(&json!({
            "connections": {"scoreboard": true},
            "officials": {"first": "Ada"},
            "status": "ended"
        }));
        merge_structured(existing.as_object(), &mut update);
        assert_eq!(update["connections"], json!({"referee": true, "scoreboard": true}));
        assert_eq!(update["officials"], json!({"first": "Ada"}));
        assert_eq!(update["status"], "ended");

        let mut untouched = object(&json!({"connections": {"a": 1}}));
        merge_structured(None, &mut untouched);
        assert_eq!(untouched["connections"], json!({"a": 1}));
    }
}
