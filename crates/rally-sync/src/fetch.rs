//! Full-state fetch.
//!
//! Both transports only say "something changed"; the current state of a
//! match is always re-read in full through a [`SnapshotSource`]. The primary
//! server answers `GET /api/match/:id`. When it cannot be reached the hosted
//! service's rows are read directly and the same payload is derived from them.

use async_trait::async_trait;
use rally_proto::payload::{MatchDataResponse, MatchRow};
use rally_proto::snapshot::RawLiveState;
use rally_proto::{MatchId, MatchPayload};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};

/// Sport tag carried by every row this layer writes to the hosted service.
pub const SPORT_TYPE: &str = "beach";

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, match_id: &MatchId) -> SyncResult<MatchPayload>;
}

/// Which PIN a display is presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinKind {
    Referee,
    HomeTeam,
    AwayTeam,
}

#[derive(Debug, Serialize)]
struct PinRequest<'a> {
    pin: &'a str,
    #[serde(rename = "type")]
    kind: PinKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinValidation {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "match")]
    pub match_info: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchListing {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub matches: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Client for the primary scorekeeping server's HTTP API.
#[derive(Clone)]
pub struct ServerApi {
    http: Client,
    base_url: String,
}

impl ServerApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self::new(cfg.server_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_match(&self, match_id: &MatchId) -> SyncResult<MatchPayload> {
        let url = format!("{}/api/match/{}", self.base_url, match_id);
        let res = self.http.get(url).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(match_id.clone()));
        }
        if !res.status().is_success() {
            return Err(unexpected_status(res).await.into());
        }
        let body: MatchDataResponse = res.json().await?;
        if !body.success {
            return Err(RemoteError::Rejected {
                code: None,
                message: body.error.unwrap_or_else(|| "match data unavailable".to_string()),
                details: None,
                hint: None,
            }
            .into());
        }
        let mut payload = body.data.normalize();
        payload.match_id.get_or_insert_with(|| match_id.clone());
        Ok(payload)
    }

    /// Checks a PIN with the server. The rules are the server's; a refused
    /// PIN comes back as `success: false` with the server's message.
    pub async fn validate_pin(&self, pin: &str, kind: PinKind) -> SyncResult<PinValidation> {
        let url = format!("{}/api/match/validate-pin", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&PinRequest { pin: pin.trim(), kind })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| format!("pin validation failed with {status}"));
            return Ok(PinValidation {
                success: false,
                error: Some(message),
                match_info: None,
            });
        }

        let text = res.text().await?;
        if text.trim().is_empty() {
            return Err(RemoteError::Rejected {
                code: None,
                message: "empty response from server".to_string(),
                details: None,
                hint: Some("is the scoresheet running and connected?".to_string()),
            }
            .into());
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn list_matches(&self) -> SyncResult<MatchListing> {
        let url = format!("{}/api/match/list", self.base_url);
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            return Ok(MatchListing {
                success: false,
                matches: Vec::new(),
                error: Some(format!("HTTP {}", res.status())),
            });
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl SnapshotSource for ServerApi {
    async fn fetch(&self, match_id: &MatchId) -> SyncResult<MatchPayload> {
        self.get_match(match_id).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct RestErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

async fn unexpected_status(res: reqwest::Response) -> RemoteError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    status_error(status, &body)
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return RemoteError::Unreachable(format!("unexpected status: {status}"));
    }
    let parsed: RestErrorBody = serde_json::from_str(body).unwrap_or_default();
    RemoteError::Rejected {
        code: parsed.code.or_else(|| Some(status.as_u16().to_string())),
        message: parsed.message.unwrap_or_else(|| format!("unexpected status: {status} body={body}")),
        details: parsed.details,
        hint: parsed.hint,
    }
}

/// Thin PostgREST client for the hosted service.
///
/// `rest_url` is the REST root (for example `https://project.host/rest/v1`);
/// tables live directly under it. Filters are `(column, value)` pairs and are
/// always equality matches.
#[derive(Clone)]
pub struct HostedClient {
    http: Client,
    rest_url: String,
    api_key: String,
}

impl HostedClient {
    pub fn new(rest_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Option<Self> {
        Some(Self::new(
            cfg.feed_rest_url.clone()?,
            cfg.feed_api_key.clone().unwrap_or_default(),
        ))
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn eq_filters(filters: &[(&str, &str)]) -> Vec<(String, String)> {
        filters
            .iter()
            .map(|(column, value)| (column.to_string(), format!("eq.{value}")))
            .collect()
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(&str, &str)],
        limit: Option<usize>,
    ) -> Result<Vec<T>, RemoteError> {
        let mut query = Self::eq_filters(filters);
        query.push(("select".to_string(), columns.to_string()));
        if let Some(limit) = limit {
            query.push(("limit".to_string(), limit.to_string()));
        }
        let res = self.request(reqwest::Method::GET, table).query(&query).send().await?;
        if !res.status().is_success() {
            return Err(unexpected_status(res).await);
        }
        Ok(res.json().await?)
    }

    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(&str, &str)],
    ) -> Result<Option<T>, RemoteError> {
        Ok(self.select(table, columns, filters, Some(1)).await?.into_iter().next())
    }

    /// Insert-or-merge keyed on `on_conflict`.
    pub async fn upsert(&self, table: &str, body: &Value, on_conflict: &str) -> Result<(), RemoteError> {
        let res = self
            .request(reqwest::Method::POST, table)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(unexpected_status(res).await);
        }
        Ok(())
    }

    pub async fn update(&self, table: &str, body: &Value, filters: &[(&str, &str)]) -> Result<(), RemoteError> {
        let res = self
            .request(reqwest::Method::PATCH, table)
            .query(&Self::eq_filters(filters))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(unexpected_status(res).await);
        }
        Ok(())
    }

    /// Cheapest query that proves the service is reachable and the key works.
    pub async fn probe(&self) -> Result<(), RemoteError> {
        self.select::<Value>("matches", "id", &[], Some(1)).await.map(|_| ())
    }

    /// Internal row id of the match with this external id.
    pub async fn resolve_row_id(&self, match_id: &MatchId) -> Result<Option<String>, RemoteError> {
        #[derive(Deserialize)]
        struct IdRow {
            id: String,
        }
        let by_external: Option<IdRow> = self
            .select_one("matches", "id", &[("external_id", match_id.as_str())])
            .await?;
        if let Some(row) = by_external {
            return Ok(Some(row.id));
        }
        if match_id.looks_like_row_id() {
            let by_id: Option<IdRow> = self.select_one("matches", "id", &[("id", match_id.as_str())]).await?;
            return Ok(by_id.map(|row| row.id));
        }
        Ok(None)
    }

    async fn match_row(&self, match_id: &MatchId) -> Result<Option<MatchRow>, RemoteError> {
        let by_external = self
            .select_one("matches", "*", &[("external_id", match_id.as_str())])
            .await?;
        if by_external.is_some() || !match_id.looks_like_row_id() {
            return Ok(by_external);
        }
        self.select_one("matches", "*", &[("id", match_id.as_str())]).await
    }
}

/// Reads the hosted rows directly and derives a payload from them.
#[derive(Clone)]
pub struct HostedSnapshotSource {
    client: HostedClient,
}

impl HostedSnapshotSource {
    pub fn new(client: HostedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotSource for HostedSnapshotSource {
    async fn fetch(&self, match_id: &MatchId) -> SyncResult<MatchPayload> {
        let row = self
            .client
            .match_row(match_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(match_id.clone()))?;
        let live: Option<RawLiveState> = self
            .client
            .select_one("match_live_state", "*", &[("match_id", row.id.as_str())])
            .await?;
        Ok(MatchPayload::from_hosted(match_id, &row, live))
    }
}

/// Tries the primary source and falls back to the secondary on any failure.
#[derive(Clone)]
pub struct FallbackSnapshotSource {
    primary: Arc<dyn SnapshotSource>,
    fallback: Option<Arc<dyn SnapshotSource>>,
}

impl FallbackSnapshotSource {
    pub fn new(primary: Arc<dyn SnapshotSource>, fallback: Option<Arc<dyn SnapshotSource>>) -> Self {
        Self { primary, fallback }
    }

    /// Primary server first, hosted rows second when the hosted REST root is configured.
    pub fn from_config(cfg: &SyncConfig) -> Self {
        let fallback = HostedClient::from_config(cfg)
            .map(|client| Arc::new(HostedSnapshotSource::new(client)) as Arc<dyn SnapshotSource>);
        Self::new(Arc::new(ServerApi::from_config(cfg)), fallback)
    }
}

#[async_trait]
impl SnapshotSource for FallbackSnapshotSource {
    async fn fetch(&self, match_id: &MatchId) -> SyncResult<MatchPayload> {
        match self.primary.fetch(match_id).await {
            Ok(payload) => Ok(payload),
            Err(err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                tracing::debug!(
                    target = "rally.fetch",
                    match_id = %match_id,
                    error = %err,
                    "primary fetch failed; reading hosted rows"
                );
                fallback.fetch(match_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn server_app() -> Router {
        Router::new()
            .route(
                "/api/match/:id",
                get(|Path(id): Path<String>| async move {
                    if id == "missing" {
                        return (AxumStatus::NOT_FOUND, Json(json!({"success": false})));
                    }
                    (
                        AxumStatus::OK,
                        Json(json!({
                            "success": true,
                            "match": {"id": id, "status": "live"},
                            "homeTeam": {"id": 1, "name": "Panthers"},
                            "awayTeam": {"id": 2, "name": "Gulls"},
                            "sets": [{"index": 1, "homePoints": 10, "awayPoints": 8}],
                            "events": [],
                            "_timestamp": 42
                        })),
                    )
                }),
            )
            .route(
                "/api/match/validate-pin",
                post(|Json(body): Json<Value>| async move {
                    if body["pin"] == "123456" && body["type"] == "referee" {
                        (AxumStatus::OK, Json(json!({"success": true, "match": {"id": "M1"}})))
                    } else {
                        (AxumStatus::UNAUTHORIZED, Json(json!({"error": "Invalid PIN"})))
                    }
                }),
            )
            .route(
                "/api/match/list",
                get(|| async { Json(json!({"success": true, "matches": [{"id": "M1"}, {"id": "M2"}]})) }),
            )
    }

    #[tokio::test]
    async fn fetches_and_normalizes_match_data() {
        let api = ServerApi::new(serve(server_app()).await);
        let payload = api.get_match(&MatchId::new("M1")).await.unwrap();
        assert_eq!(payload.match_id, Some(MatchId::new("M1")));
        assert_eq!(payload.home_team.and_then(|t| t.name).as_deref(), Some("Panthers"));
        assert_eq!(payload.periods[0].home_points, 10);
        assert_eq!(payload.timestamp, Some(42));

        let err = api.get_match(&MatchId::new("missing")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn pin_validation_and_listing() {
        let api = ServerApi::new(serve(server_app()).await);
        let ok = api.validate_pin(" 123456 ", PinKind::Referee).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.match_info.unwrap()["id"], "M1");

        let refused = api.validate_pin("000000", PinKind::HomeTeam).await.unwrap();
        assert!(!refused.success);
        assert_eq!(refused.error.as_deref(), Some("Invalid PIN"));

        let listing = api.list_matches().await.unwrap();
        assert!(listing.success);
        assert_eq!(listing.matches.len(), 2);
    }

    fn hosted_app() -> Router {
        Router::new()
            .route(
                "/matches",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let row = json!({
                        "id": "0c8f5a7e-0000-4000-8000-000000000001",
                        "external_id": "M1",
                        "status": "live",
                        "team1_team": {"name": "Panthers"},
                        "team2_team": {"name": "Gulls"}
                    });
                    let hit = q.get("external_id").map(String::as_str) == Some("eq.M1")
                        || q.get("id").map(String::as_str) == Some("eq.0c8f5a7e-0000-4000-8000-000000000001")
                        || (!q.contains_key("external_id") && !q.contains_key("id"));
                    Json(if hit { json!([row]) } else { json!([]) })
                }),
            )
            .route(
                "/match_live_state",
                get(|| async {
                    Json(json!([{
                        "match_id": "0c8f5a7e-0000-4000-8000-000000000001",
                        "team_a_name": "Gulls",
                        "side_a": "left",
                        "points_a": 5,
                        "points_b": 3
                    }]))
                }),
            )
    }

    #[tokio::test]
    async fn hosted_source_resolves_by_external_then_row_id() {
        let client = HostedClient::new(serve(hosted_app()).await, "anon");
        client.probe().await.unwrap();

        assert_eq!(
            client.resolve_row_id(&MatchId::new("M1")).await.unwrap().as_deref(),
            Some("0c8f5a7e-0000-4000-8000-000000000001")
        );
        assert_eq!(
            client
                .resolve_row_id(&MatchId::new("0c8f5a7e-0000-4000-8000-000000000001"))
                .await
                .unwrap()
                .as_deref(),
            Some("0c8f5a7e-0000-4000-8000-000000000001")
        );
        assert_eq!(client.resolve_row_id(&MatchId::new("M9")).await.unwrap(), None);

        let source = HostedSnapshotSource::new(client);
        let payload = source.fetch(&MatchId::new("M1")).await.unwrap();
        let live = payload.live_state.unwrap();
        assert_eq!(live.points_a, 5);
        assert!(matches!(
            source.fetch(&MatchId::new("M9")).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn falls_back_when_primary_unreachable() {
        let hosted = HostedClient::new(serve(hosted_app()).await, "anon");
        let source = FallbackSnapshotSource::new(
            Arc::new(ServerApi::new("http://127.0.0.1:9")),
            Some(Arc::new(HostedSnapshotSource::new(hosted))),
        );
        let payload = source.fetch(&MatchId::new("M1")).await.unwrap();
        assert!(payload.live_state.is_some());
    }

    #[test]
    fn status_errors_split_transient_from_rejected() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_unreachable());
        let rejected = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":"23502","message":"null value in column","hint":"check payload"}"#,
        );
        assert_eq!(rejected.code(), Some("23502"));
        assert_eq!(rejected.to_string(), "remote rejected write (23502): null value in column");
        assert_eq!(status_error(StatusCode::FORBIDDEN, "nope").code(), Some("403"));
    }
}
