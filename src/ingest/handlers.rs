//! HTTP handlers for the ingestion front-end.
//!
//! The POST handlers are the only place in the system that ever sees raw
//! credentials: the fingerprint is computed here and the `nas`/`code`
//! never reach the bus, the audit log, or the tallies.

use std::future::Future;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::VALIDATION_QUEUE;
use crate::domain::{election_scope, ElectionBallot, ElectionVote, Envelope, Fingerprint, LawBallot};

use super::state::AppState;

/// Body of a `202 Accepted` response: an opaque request identifier for the
/// client's records. Vote outcomes are asynchronous; duplicates surface on
/// the operator review channel, never here.
#[derive(Debug, Serialize)]
pub struct VoteAccepted {
    pub request_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

const ERROR_BUS_UNAVAILABLE: ErrorBody = ErrorBody { error: "bus_unavailable" };
const ERROR_DEADLINE: ErrorBody = ErrorBody { error: "deadline_exceeded" };
const ERROR_ELECTION_CLOSED: ErrorBody = ErrorBody { error: "election_closed" };
const ERROR_NOT_FOUND: ErrorBody = ErrorBody { error: "not_found" };
const ERROR_INTERNAL: ErrorBody = ErrorBody { error: "internal" };

/// `POST /vote`: law ballot.
pub async fn submit_vote(State(state): State<AppState>, Json(ballot): Json<LawBallot>) -> Response {
    if let Err(e) = ballot.validate() {
        return (StatusCode::BAD_REQUEST, Json(e)).into_response();
    }

    let fingerprint = Fingerprint::compute(&ballot.nas, &ballot.code, &ballot.ballot_id);
    let envelope = Envelope::law(fingerprint, ballot.ballot_id.clone(), ballot.choice, Utc::now());

    with_deadline(&state, publish_envelope(&state, envelope)).await
}

/// `POST /elections/vote`: election ballot, gated on the voting window.
pub async fn submit_election_vote(
    State(state): State<AppState>,
    Json(ballot): Json<ElectionBallot>,
) -> Response {
    if let Err(e) = ballot.validate() {
        return (StatusCode::BAD_REQUEST, Json(e)).into_response();
    }

    let response = async {
        match state.windows().window(ballot.election_id).await {
            Ok(Some((start, end))) => {
                let now = Utc::now();
                if now < start || now >= end {
                    return (StatusCode::BAD_REQUEST, Json(ERROR_ELECTION_CLOSED)).into_response();
                }
            }
            // Unregistered elections carry no window to enforce.
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "window lookup failed");
                return (StatusCode::SERVICE_UNAVAILABLE, Json(ERROR_BUS_UNAVAILABLE)).into_response();
            }
        }

        let scope = election_scope(ballot.election_id);
        let fingerprint = Fingerprint::compute(&ballot.nas, &ballot.code, &scope);
        let envelope = Envelope::election(
            fingerprint,
            ElectionVote {
                election_id: ballot.election_id,
                region_id: ballot.region_id,
                method: ballot.method,
                single_choice: ballot.single_choice,
                ranked_choices: ballot.ranked_choices.clone(),
            },
            Utc::now(),
        );
        publish_envelope(&state, envelope).await
    };

    with_deadline(&state, response).await
}

/// Publish with broker confirmation. `202` is returned only once the bus
/// has durably accepted the envelope; anything else is back-pressure.
async fn publish_envelope(state: &AppState, envelope: Envelope) -> Response {
    let payload = match serde_json::to_vec(&envelope) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "envelope encode failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ERROR_INTERNAL)).into_response();
        }
    };

    let publish = state
        .bus()
        .publish(VALIDATION_QUEUE, envelope.routing_key(), payload);
    match timeout(state.publish_confirm_timeout(), publish).await {
        Ok(Ok(_)) => {
            let accepted = VoteAccepted {
                request_id: Uuid::new_v4(),
                status: "accepted",
            };
            info!(request_id = %accepted.request_id, scope = %envelope.scope(), "ballot queued");
            (StatusCode::ACCEPTED, Json(accepted)).into_response()
        }
        Ok(Err(e)) => {
            warn!(error = %e, back_pressure = e.is_back_pressure(), "publish failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(ERROR_BUS_UNAVAILABLE)).into_response()
        }
        Err(_) => {
            warn!("publish confirmation timed out");
            (StatusCode::SERVICE_UNAVAILABLE, Json(ERROR_BUS_UNAVAILABLE)).into_response()
        }
    }
}

async fn with_deadline(state: &AppState, work: impl Future<Output = Response>) -> Response {
    match timeout(state.request_deadline(), work).await {
        Ok(response) => response,
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(ERROR_DEADLINE)).into_response(),
    }
}

/// `GET /results/{ballot_id}`: law tally read-through.
pub async fn law_results(
    State(state): State<AppState>,
    Path(ballot_id): Path<String>,
) -> Response {
    match state.tally().law_results(&ballot_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(ERROR_NOT_FOUND)).into_response(),
        Err(e) => {
            warn!(error = %e, "law results query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ERROR_INTERNAL)).into_response()
        }
    }
}

/// `GET /results`: every law tally.
pub async fn all_law_results(State(state): State<AppState>) -> Response {
    match state.tally().all_law_results().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!(error = %e, "law results query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ERROR_INTERNAL)).into_response()
        }
    }
}

/// `GET /elections`: registered elections with their windows.
pub async fn list_elections(State(state): State<AppState>) -> Response {
    match state.tally().elections().await {
        Ok(elections) => Json(elections).into_response(),
        Err(e) => {
            warn!(error = %e, "election listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ERROR_INTERNAL)).into_response()
        }
    }
}

/// `GET /elections/{election_id}/regions/{region_id}/results`.
pub async fn election_results(
    State(state): State<AppState>,
    Path((election_id, region_id)): Path<(i64, i64)>,
) -> Response {
    match state.tally().election_results(election_id, region_id).await {
        Ok(rows) if rows.is_empty() => (StatusCode::NOT_FOUND, Json(ERROR_NOT_FOUND)).into_response(),
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!(error = %e, "election results query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ERROR_INTERNAL)).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    services: std::collections::BTreeMap<&'static str, &'static str>,
}

/// `GET /health`: liveness plus per-dependency connectivity.
pub async fn health(State(state): State<AppState>) -> Response {
    let mut services = std::collections::BTreeMap::new();
    services.insert(
        "bus",
        match state.bus().ping().await {
            Ok(()) => "connected",
            Err(_) => "disconnected",
        },
    );
    services.insert(
        "tally_store",
        match state.tally().ping().await {
            Ok(()) => "connected",
            Err(_) => "disconnected",
        },
    );

    let healthy = services.values().all(|s| *s == "connected");
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        services,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::super::router::build_router;
    use super::*;
    use crate::bus::{BusOptions, MessageBus};
    use crate::config::{BrokerConfig, HttpConfig};
    use crate::store::{open_pool, Election, LawDelta, TallyStore};

    struct Rig {
        _dir: tempfile::TempDir,
        bus: MessageBus,
        tally: TallyStore,
        router: axum::Router,
    }

    fn rig() -> Rig {
        rig_with(BusOptions::default())
    }

    fn rig_with(options: BusOptions) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(&dir.path().join("bus.db"), options).unwrap();
        let pool = open_pool(&dir.path().join("tally.db")).unwrap();
        let tally = TallyStore::new(pool);
        let state = AppState::new(
            bus.clone(),
            tally.clone(),
            &HttpConfig::default(),
            &BrokerConfig::default(),
        );
        Rig {
            _dir: dir,
            bus,
            tally,
            router: build_router(&state),
        }
    }

    async fn post_json(router: &axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn get(router: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn law_body() -> serde_json::Value {
        serde_json::json!({
            "nas": "123456789",
            "code": "ABC123",
            "ballot_id": "L2025-001",
            "choice": "yes",
        })
    }

    #[tokio::test]
    async fn valid_law_vote_is_accepted_and_published() {
        let rig = rig();
        let (status, body) = post_json(&rig.router, "/vote", law_body()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert!(body["request_id"].is_string());
        assert_eq!(rig.bus.depth(VALIDATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_payload_carries_no_raw_credentials() {
        let rig = rig();
        post_json(&rig.router, "/vote", law_body()).await;

        let delivery = rig
            .bus
            .dequeue(VALIDATION_QUEUE, "test", 1)
            .await
            .unwrap()
            .remove(0);
        let text = String::from_utf8(delivery.payload).unwrap();
        assert!(!text.contains("123456789"));
        assert!(!text.contains("ABC123"));
        assert!(!text.contains("nas"));

        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(
            envelope.fingerprint,
            Fingerprint::compute("123456789", "ABC123", "L2025-001").as_str()
        );
    }

    #[tokio::test]
    async fn shape_errors_name_the_field() {
        let rig = rig();
        let mut body = law_body();
        body["nas"] = serde_json::json!("12345678");
        let (status, response) = post_json(&rig.router, "/vote", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["field"], "nas");

        let mut body = law_body();
        body["ballot_id"] = serde_json::json!("");
        let (status, response) = post_json(&rig.router, "/vote", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["field"], "ballot_id");
    }

    #[tokio::test]
    async fn full_queue_returns_back_pressure() {
        let rig = rig_with(BusOptions {
            max_length: 1,
            ..BusOptions::default()
        });
        let (status, _) = post_json(&rig.router, "/vote", law_body()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = post_json(&rig.router, "/vote", law_body()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "bus_unavailable");
    }

    fn election_body() -> serde_json::Value {
        serde_json::json!({
            "nas": "123456789",
            "code": "ABC123",
            "election_id": 1,
            "region_id": 1,
            "method": "single",
            "single_choice": 7,
        })
    }

    #[tokio::test]
    async fn election_vote_respects_window_boundaries() {
        let rig = rig();
        let now = Utc::now();

        // Window opens in the future: rejected.
        rig.tally
            .upsert_election(Election {
                id: 1,
                name: None,
                method: "single".to_string(),
                start_at: now + chrono::Duration::hours(1),
                end_at: now + chrono::Duration::hours(2),
            })
            .await
            .unwrap();
        let (status, body) = post_json(&rig.router, "/elections/vote", election_body()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "election_closed");

        // Open window: accepted. The cache may hold the stale window, so
        // the registry update goes through a fresh election id.
        rig.tally
            .upsert_election(Election {
                id: 2,
                name: None,
                method: "single".to_string(),
                start_at: now - chrono::Duration::hours(1),
                end_at: now + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        let mut body = election_body();
        body["election_id"] = serde_json::json!(2);
        let (status, _) = post_json(&rig.router, "/elections/vote", body).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // Window already over: rejected.
        rig.tally
            .upsert_election(Election {
                id: 3,
                name: None,
                method: "single".to_string(),
                start_at: now - chrono::Duration::hours(2),
                end_at: now - chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        let mut body = election_body();
        body["election_id"] = serde_json::json!(3);
        let (status, response) = post_json(&rig.router, "/elections/vote", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"], "election_closed");
    }

    #[tokio::test]
    async fn ranked_ballot_shape_is_enforced() {
        let rig = rig();
        let body = serde_json::json!({
            "nas": "123456789",
            "code": "ABC123",
            "election_id": 1,
            "region_id": 1,
            "method": "ranked",
            "ranked_choices": [7, 3, 7],
        });
        let (status, response) = post_json(&rig.router, "/elections/vote", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["field"], "ranked_choices");
    }

    #[tokio::test]
    async fn results_read_through() {
        let rig = rig();
        let (status, _) = get(&rig.router, "/results/L2025-001").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        rig.tally
            .apply_batch(
                vec![LawDelta {
                    ballot_id: "L2025-001".to_string(),
                    yes: 4,
                    no: 2,
                }],
                vec![],
            )
            .await
            .unwrap();

        let (status, body) = get(&rig.router, "/results/L2025-001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["yes_count"], 4);
        assert_eq!(body["no_count"], 2);
        assert_eq!(body["total_votes"], 6);

        let (status, body) = get(&rig.router, "/results").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_reports_dependencies() {
        let rig = rig();
        let (status, body) = get(&rig.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["services"]["bus"], "connected");
        assert_eq!(body["services"]["tally_store"], "connected");
    }
}
