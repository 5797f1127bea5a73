use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::api::handler;
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::queue::TaskQueue;

pub struct AppState {
    pub config: AppConfig,
    pub engine: Engine,
    pub task_queue: RwLock<TaskQueue>,
    /// Cancellation handle of each executing run, by entity.
    in_flight: RwLock<HashMap<String, CancellationToken>>,
    /// Fired once on process shutdown. Every run token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Engine) -> Self {
        Self {
            config,
            engine,
            task_queue: RwLock::new(TaskQueue::new()),
            in_flight: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a run for `entity_id` and hand out its cancellation token.
    pub async fn track(&self, entity_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.in_flight
            .write()
            .await
            .insert(entity_id.to_string(), token.clone());
        token
    }

    pub async fn untrack(&self, entity_id: &str) {
        self.in_flight.write().await.remove(entity_id);
    }

    pub async fn get_in_flight_entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self.in_flight.read().await.keys().cloned().collect();
        entities.sort();
        entities
    }

    /// Cancel the executing run for an entity. Takes effect at its next poll boundary.
    pub async fn cancel_entity(&self, entity_id: &str) -> bool {
        match self.in_flight.read().await.get(entity_id) {
            Some(token) => {
                tracing::info!(entity_id, "Cancelling in-flight run");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs/workflow", post(handler::submit_workflow))
        .route("/runs/chains/:name", post(handler::submit_chain))
        .route("/runs/:entity_id", delete(handler::cancel_runs))
        .route("/health", get(health_check))
        .route("/health/stores", get(handler::store_health))
        .route("/health/services", get(handler::service_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
