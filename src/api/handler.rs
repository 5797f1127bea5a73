use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use crate::api::payload::{self, ChainRunRequest, WorkflowRunRequest};
use crate::api::signature::{verify_signature, SIGNATURE_HEADER};
use crate::queue::task::Task;
use crate::server::AppState;

type Reply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, Json(body))
}

fn verify(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Reply> {
    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => {
            tracing::warn!("Missing X-Loanflow-Signature-256 header");
            return Err(reply(
                StatusCode::UNAUTHORIZED,
                json!({ "error": "missing signature" }),
            ));
        }
    };

    verify_signature(state.config.api_secret(), body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Request signature verification failed");
        reply(StatusCode::UNAUTHORIZED, json!({ "error": "bad signature" }))
    })
}

async fn enqueue(state: &AppState, task: Task) -> Reply {
    let description = task.description();
    let entity_id = task.entity_id().to_string();
    state.task_queue.write().await.enqueue(task);
    reply(
        StatusCode::ACCEPTED,
        json!({ "entity_id": entity_id, "queued": description }),
    )
}

pub async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if let Err(rejection) = verify(&state, &headers, &body) {
        return rejection;
    }

    let request: WorkflowRunRequest = match payload::parse(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "Failed to parse workflow run request");
            return reply(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }));
        }
    };

    if !state.engine.has_workflow() {
        return reply(
            StatusCode::NOT_FOUND,
            json!({ "error": "no workflow configured" }),
        );
    }

    tracing::info!(entity_id = %request.entity_id, target = ?request.target, "Workflow run requested");

    enqueue(
        &state,
        Task::AdvanceWorkflow {
            entity_id: request.entity_id,
            start: request.start,
            target: request.target,
        },
    )
    .await
}

pub async fn submit_chain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if let Err(rejection) = verify(&state, &headers, &body) {
        return rejection;
    }

    let request: ChainRunRequest = match payload::parse(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, chain = %name, "Failed to parse chain run request");
            return reply(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }));
        }
    };

    if !state.engine.has_chain(&name) {
        return reply(
            StatusCode::NOT_FOUND,
            json!({ "error": format!("unknown chain {name}") }),
        );
    }

    tracing::info!(entity_id = %request.entity_id, chain = %name, "Chain run requested");

    enqueue(
        &state,
        Task::ReconcileChain {
            chain: name,
            entity_id: request.entity_id,
        },
    )
    .await
}

/// Drop queued runs for the entity and cancel the one executing, if any.
pub async fn cancel_runs(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if let Err(rejection) = verify(&state, &headers, entity_id.as_bytes()) {
        return rejection;
    }

    let removed = state.task_queue.write().await.cancel_entity(&entity_id);
    let cancelled = state.cancel_entity(&entity_id).await;

    reply(
        StatusCode::OK,
        json!({ "entity_id": entity_id, "dropped": removed, "cancelled_in_flight": cancelled }),
    )
}

pub async fn store_health(State(state): State<Arc<AppState>>) -> Reply {
    let report = state.engine.check().await;
    let status = if report.stores.iter().all(|s| s.available) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    reply(status, json!({ "stores": report.stores }))
}

pub async fn service_health(State(state): State<Arc<AppState>>) -> Reply {
    let report = state.engine.check().await;
    let status = if report.services.iter().all(|s| s.up) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    reply(status, json!({ "services": report.services }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::signature::sign;
    use crate::config::AppConfig;
    use crate::engine::Engine;
    use crate::store::StoreRegistry;
    use crate::testing::ScriptedStore;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    const SECRET: &str = "test-secret";

    fn state(stores: StoreRegistry) -> Arc<AppState> {
        let config: AppConfig =
            serde_json::from_value(json!({ "api": { "secret": SECRET } })).unwrap();
        let engine = Engine::new(reqwest::Client::new(), stores, None, HashMap::new(), Vec::new());
        Arc::new(AppState::new(config, engine))
    }

    fn signed(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign(SECRET, body).unwrap()).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_unsigned_request_rejected() {
        let state = state(StoreRegistry::new());
        let body = Bytes::from_static(br#"{"entity_id":"app-1"}"#);

        let (status, _) = submit_workflow(State(state.clone()), HeaderMap::new(), body.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = {
            let mut h = HeaderMap::new();
            h.insert(
                SIGNATURE_HEADER,
                HeaderValue::from_str(&sign("other", &body).unwrap()).unwrap(),
            );
            h
        };
        let (status, _) = submit_workflow(State(state.clone()), wrong, body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.task_queue.read().await.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_chain_and_missing_workflow_are_404() {
        let state = state(StoreRegistry::new());
        let body = br#"{"entity_id":"app-1"}"#;

        let (status, _) = submit_chain(
            State(state.clone()),
            Path("lead_push".to_string()),
            signed(body),
            Bytes::from_static(body),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            submit_workflow(State(state.clone()), signed(body), Bytes::from_static(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let state = state(StoreRegistry::new());
        let body = br#"{"entity":"app-1"}"#;
        let (status, _) =
            submit_workflow(State(state), signed(body), Bytes::from_static(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_runs() {
        let state = state(StoreRegistry::new());
        state.task_queue.write().await.enqueue(Task::ReconcileChain {
            chain: "lead_push".to_string(),
            entity_id: "app-1".to_string(),
        });
        let token = state.track("app-1").await;

        let (status, Json(body)) = cancel_runs(
            State(state.clone()),
            Path("app-1".to_string()),
            signed(b"app-1"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dropped"], 1);
        assert_eq!(body["cancelled_in_flight"], true);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_store_health_reports_unavailable() {
        let mut stores = StoreRegistry::new();
        let down = ScriptedStore::new("lending");
        down.set_available(false);
        stores.register(Arc::new(down));

        let (status, Json(body)) = store_health(State(state(stores))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["stores"][0]["available"], false);
    }
}
