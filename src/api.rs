use axum::{
    async_trait,
    routing::{get, post},
    Router, Json,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::chain::{Block, Call, Chain, Receipt};
use crate::error::{ChainError, ErrorKind};
use crate::p2p::NetworkMessage;
use crate::task::{Address, Amount, Task, TaskId};
use crate::wallet::{NewWallet, Wallet};

pub struct AppState {
    pub chain: Arc<Mutex<Chain>>,
    /// Committed receipts and sealed blocks go out on the gossip feed.
    pub outbox: UnboundedSender<NetworkMessage>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        let status = match &err {
            ChainError::Ledger(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                ErrorKind::InvalidState => StatusCode::CONFLICT,
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::Transfer => StatusCode::BAD_GATEWAY,
            },
            ChainError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChainError::UnknownWallet(_) | ChainError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            ChainError::Unavailable(_) | ChainError::WalletCreation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub const ADDRESS_HEADER: &str = "x-wallet-address";
pub const KEY_HEADER: &str = "x-wallet-key";

/// Wallet address and key sent with every state-changing request.
/// The key is checked against the wallet before the call runs.
pub struct Credentials {
    pub address: Address,
    pub key: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for Credentials
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        match (header(ADDRESS_HEADER), header(KEY_HEADER)) {
            (Some(address), Some(key)) => Ok(Self { address, key }),
            _ => Err(ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: format!("Missing {} or {} header", ADDRESS_HEADER, KEY_HEADER),
            }),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chain", get(get_chain))
        .route("/blocks", post(seal_block))
        .route("/wallets", get(get_wallets).post(create_wallet))
        .route("/tasks", post(post_task))
        .route("/tasks/open", get(get_open_tasks))
        .route("/tasks/poster/:address", get(get_tasks_by_poster))
        .route("/tasks/worker/:address", get(get_tasks_by_worker))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/accept", post(accept_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/confirm", post(confirm_completion))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/withdraw", post(withdraw_from_task))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_api_server(state: Arc<AppState>, addr: &str) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server running on http://{}", addr);
    axum::serve(listener, app).await
}

fn lock(state: &AppState) -> Result<MutexGuard<'_, Chain>, ApiError> {
    state
        .chain
        .lock()
        .map_err(|e| ChainError::Unavailable(e.to_string()).into())
}

fn submit(state: &AppState, credentials: Credentials, call: Call) -> Result<Json<Receipt>, ApiError> {
    let receipt = lock(state)?.execute_authenticated(&credentials.address, &credentials.key, call)?;
    if state.outbox.send(NetworkMessage::Receipt(receipt.clone())).is_err() {
        warn!("gossip outbox closed, receipt not published");
    }
    Ok(Json(receipt))
}

async fn get_chain(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(lock(&state)?.blocks.clone()))
}

async fn seal_block(State(state): State<Arc<AppState>>) -> Result<Json<Option<Block>>, ApiError> {
    let block = lock(&state)?.seal_block();
    if let Some(block) = &block {
        if state.outbox.send(NetworkMessage::Block(block.clone())).is_err() {
            warn!("gossip outbox closed, block not published");
        }
    }
    Ok(Json(block))
}

async fn get_wallets(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Wallet>>, ApiError> {
    Ok(Json(lock(&state)?.wallets.get_all_wallets()))
}

/// The response is the only place the mnemonic and key are ever shown.
async fn create_wallet(State(state): State<Arc<AppState>>) -> Result<Json<NewWallet>, ApiError> {
    Ok(Json(lock(&state)?.create_wallet()?))
}

async fn get_open_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<TaskId>>, ApiError> {
    Ok(Json(lock(&state)?.ledger.open_tasks()))
}

async fn get_tasks_by_poster(
    State(state): State<Arc<AppState>>,
    Path(address): Path<Address>,
) -> Result<Json<Vec<TaskId>>, ApiError> {
    Ok(Json(lock(&state)?.ledger.tasks_by_poster(&address)))
}

async fn get_tasks_by_worker(
    State(state): State<Arc<AppState>>,
    Path(address): Path<Address>,
) -> Result<Json<Vec<TaskId>>, ApiError> {
    Ok(Json(lock(&state)?.ledger.tasks_by_worker(&address)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    let task = lock(&state)?.ledger.get_task(id).map_err(ChainError::from)?;
    Ok(Json(task))
}

#[derive(Deserialize)]
struct PostTaskRequest {
    description: String,
    reward: Amount,
}

async fn post_task(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    Json(payload): Json<PostTaskRequest>,
) -> Result<Json<Receipt>, ApiError> {
    let call = Call::PostTask { description: payload.description, reward: payload.reward };
    submit(&state, credentials, call)
}

async fn accept_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    credentials: Credentials,
) -> Result<Json<Receipt>, ApiError> {
    submit(&state, credentials, Call::AcceptTask { id })
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    credentials: Credentials,
) -> Result<Json<Receipt>, ApiError> {
    submit(&state, credentials, Call::CompleteTask { id })
}

async fn confirm_completion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    credentials: Credentials,
) -> Result<Json<Receipt>, ApiError> {
    submit(&state, credentials, Call::ConfirmCompletion { id })
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    credentials: Credentials,
) -> Result<Json<Receipt>, ApiError> {
    submit(&state, credentials, Call::CancelTask { id })
}

async fn withdraw_from_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    credentials: Credentials,
) -> Result<Json<Receipt>, ApiError> {
    submit(&state, credentials, Call::WithdrawFromTask { id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::UNIT;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tower::ServiceExt;

    const POSTER: (&str, &str) = ("poster", "poster-key");
    const WORKER: (&str, &str) = ("worker", "worker-key");

    fn test_state() -> (Arc<AppState>, UnboundedReceiver<NetworkMessage>) {
        let mut chain = Chain::new(0);
        chain.wallets.insert(Wallet::new(POSTER.0.to_string(), 10 * UNIT).with_key(POSTER.1));
        chain.wallets.insert(Wallet::new(WORKER.0.to_string(), 0).with_key(WORKER.1));
        let (outbox, inbox) = unbounded_channel();
        let state = Arc::new(AppState { chain: Arc::new(Mutex::new(chain)), outbox });
        (state, inbox)
    }

    async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        credentials: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some((address, key)) = credentials {
            request = request.header(ADDRESS_HEADER, address).header(KEY_HEADER, key);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn post_task_as(state: &Arc<AppState>, who: (&str, &str), reward: Amount) -> (StatusCode, Value) {
        let body = serde_json::json!({ "description": "feed the cat", "reward": reward });
        send(state, "POST", "/tasks", Some(who), Some(body)).await
    }

    #[tokio::test]
    async fn mutations_require_wallet_credentials() {
        let (state, _inbox) = test_state();
        let body = serde_json::json!({ "description": "feed the cat", "reward": UNIT });

        let (status, _) = send(&state, "POST", "/tasks", None, Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, reply) = post_task_as(&state, (POSTER.0, WORKER.1), UNIT).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(reply["error"].as_str().unwrap().contains(POSTER.0));

        let (status, _) = send(&state, "POST", "/tasks/0/accept", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let chain = state.chain.lock().unwrap();
        assert_eq!(chain.ledger.task_count(), 0);
        assert_eq!(chain.wallets.balance(POSTER.0), 10 * UNIT);
    }

    #[tokio::test]
    async fn authenticated_post_is_attributed_to_the_key_holder() {
        let (state, mut inbox) = test_state();

        let (status, receipt) = post_task_as(&state, POSTER, UNIT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["caller"], POSTER.0);
        assert_eq!(receipt["events"][0]["type"], "TaskPosted");
        assert!(matches!(inbox.try_recv(), Ok(NetworkMessage::Receipt(_))));

        let (status, task) = send(&state, "GET", "/tasks/0", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["poster"], POSTER.0);
    }

    #[tokio::test]
    async fn ledger_errors_map_to_statuses() {
        let (state, _inbox) = test_state();

        let (status, _) = send(&state, "GET", "/tasks/7", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post_task_as(&state, POSTER, 0).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        post_task_as(&state, POSTER, UNIT).await;
        let (status, _) = send(&state, "POST", "/tasks/0/cancel", Some(WORKER), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&state, "POST", "/tasks/0/accept", Some(WORKER), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, reply) = send(&state, "POST", "/tasks/0/cancel", Some(POSTER), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(reply["error"].as_str().unwrap().contains("only be cancelled while open"));
    }

    #[tokio::test]
    async fn refused_payout_maps_to_bad_gateway() {
        let (state, _inbox) = test_state();
        post_task_as(&state, POSTER, UNIT).await;
        send(&state, "POST", "/tasks/0/accept", Some(WORKER), None).await;
        send(&state, "POST", "/tasks/0/complete", Some(WORKER), None).await;
        state.chain.lock().unwrap().set_rejects_deposits(WORKER.0, true).unwrap();

        let (status, _) = send(&state, "POST", "/tasks/0/confirm", Some(POSTER), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (_, task) = send(&state, "GET", "/tasks/0", None, None).await;
        assert_eq!(task["status"], "Completed");
        assert_eq!(task["reward"], UNIT);
    }

    #[tokio::test]
    async fn named_task_routes_are_not_read_as_ids() {
        let (state, _inbox) = test_state();
        post_task_as(&state, POSTER, UNIT).await;
        post_task_as(&state, POSTER, 2 * UNIT).await;
        send(&state, "POST", "/tasks/1/accept", Some(WORKER), None).await;

        let (status, open) = send(&state, "GET", "/tasks/open", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(open, serde_json::json!([0]));

        let (_, posted) = send(&state, "GET", "/tasks/poster/poster", None, None).await;
        assert_eq!(posted, serde_json::json!([0, 1]));
        let (_, worked) = send(&state, "GET", "/tasks/worker/worker", None, None).await;
        assert_eq!(worked, serde_json::json!([1]));
    }

    #[tokio::test]
    async fn created_wallet_can_authenticate() {
        let (state, _inbox) = test_state();
        let (status, created) = send(&state, "POST", "/wallets", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let address = created["wallet"]["address"].as_str().unwrap().to_string();
        let key = created["key"].as_str().unwrap().to_string();
        let (status, _) = send(&state, "POST", "/tasks/0/accept", Some((&address, &key)), None).await;
        // Authenticated, then rejected by the ledger: there is no task 0.
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
