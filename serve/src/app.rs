//! Axum app: state, router, and the four orchestration endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use marshal::approval::{CheckpointStore, ResumeValue, SqliteCheckpointStore};
use marshal::background::BackgroundHandler;
use marshal::chat::{ChatHandler, ChatRequest, RuntimeContextCache};
use marshal::context::{ChatContextAssembler, SqliteChatHistory};
use marshal::coordinator::CoordinatorClient;
use marshal::jobs::HttpJobApi;
use marshal::memory::{global_lqm, KbClient, MemoryAgent};
use marshal::orchestrate::{CodingRunner, OrchestrateRequest, PooledCodingDispatcher};
use marshal::pool::AgentPool;
use marshal::tools::ToolExecutor;
use marshal::{EngineSettings, LlmClient, OllamaChat};
use stream_event::EnvelopeState;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatHandler>,
    pub background: Arc<BackgroundHandler>,
    pub coding: Arc<CodingRunner>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Wires the full engine from settings. One process, one engine.
pub fn build_engine(settings: Arc<EngineSettings>) -> Result<AppState, Box<dyn std::error::Error>> {
    let llm: Arc<dyn LlmClient> = Arc::new(OllamaChat::new(
        settings.router_url.as_str(),
        settings.heartbeat_dead_seconds,
        settings.max_concurrent_local_llm,
        settings.max_concurrent_cloud_llm,
    ));
    let history = Arc::new(SqliteChatHistory::new(&settings.history_db_path)?);
    let assembler = Arc::new(ChatContextAssembler::new(
        history,
        Arc::clone(&llm),
        settings.compress_threshold,
    ));
    let coordinator = CoordinatorClient::new(settings.coordinator_url.as_str());
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::new(&settings.checkpoint_db_path)?);

    let memory = Arc::new(tokio::sync::Mutex::new(MemoryAgent::new(
        "default",
        None,
        global_lqm(&settings.memory),
        KbClient::new(settings.knowledgebase_url.as_str()),
        Arc::clone(&llm),
        &settings.memory,
    )));

    let pool = Arc::new(AgentPool::new(&settings.pool));
    pool.spawn_stuck_watchdog();
    let job_api = Arc::new(HttpJobApi::new(settings.k8s_api_url.as_str()));
    let dispatcher = Arc::new(PooledCodingDispatcher::new(
        pool,
        job_api,
        Arc::clone(&settings),
    ));
    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&memory),
        coordinator.clone(),
        dispatcher.clone(),
        settings.tool_execution_timeout_s,
        settings.max_tool_result_chars,
    ));
    let runtime_cache = Arc::new(RuntimeContextCache::new(coordinator.clone()));

    let chat = Arc::new(ChatHandler::new(
        Arc::clone(&llm),
        Arc::clone(&assembler),
        Arc::clone(&executor),
        memory,
        coordinator.clone(),
        Arc::clone(&checkpoints),
        runtime_cache,
        Arc::clone(&settings),
    ));
    let background = Arc::new(BackgroundHandler::new(
        llm,
        executor,
        assembler,
        coordinator.clone(),
        Arc::clone(&settings),
    ));
    let coding = Arc::new(CodingRunner::new(
        dispatcher,
        Arc::clone(&checkpoints),
        coordinator,
    ));

    Ok(AppState {
        chat,
        background,
        coding,
        checkpoints,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_sse))
        .route("/orchestrate/stream", post(orchestrate_stream))
        .route("/approve/:thread_id", post(approve))
        .route("/status/:thread_id", get(status))
        .with_state(state)
}

/// Streams chat events as SSE. A request without a session id gets a fresh
/// one (echoed back in every event envelope). A client disconnect drops the
/// stream, which cancels the handler between iterations via the attached drop
/// guard.
async fn chat_sse(
    State(state): State<AppState>,
    Json(mut request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    if request.session_id.is_empty() {
        request.session_id = uuid::Uuid::new_v4().to_string();
    }
    let session_id = request.session_id.clone();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let rx = state.chat.handle(request, cancel);
    let mut envelope = EnvelopeState::new(session_id);

    let stream = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        let mut value = event.to_value().unwrap_or_else(|_| json!({"type": "error"}));
        envelope.inject_into(&mut value);
        Ok(Event::default().data(value.to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Fire-and-forget background dispatch: 202, work proceeds asynchronously.
async fn orchestrate_stream(
    State(state): State<AppState>,
    Json(request): Json<OrchestrateRequest>,
) -> impl IntoResponse {
    let task_id = request.task_id.clone();
    info!(task = %task_id, "background task accepted");
    let background = Arc::clone(&state.background);
    tokio::spawn(async move {
        let result = background.handle(request).await;
        info!(task = %task_id, success = result.success, "background task finished");
    });
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
}

/// Resumes a paused run with the user's decision.
async fn approve(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(value): Json<ResumeValue>,
) -> impl IntoResponse {
    let checkpoint = match state.checkpoints.get(&thread_id).await {
        Ok(Some(cp)) => cp,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "no paused run for thread", "threadId": thread_id})),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    match checkpoint.run_kind.as_str() {
        "chat" => match state
            .chat
            .resume(&thread_id, value, CancellationToken::new())
            .await
        {
            Ok(mut rx) => {
                // The resumed run streams to nobody; drain so it can finish.
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                (StatusCode::ACCEPTED, Json(json!({"status": "resumed"})))
            }
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            ),
        },
        "coding" => {
            let coding = Arc::clone(&state.coding);
            let thread = thread_id.clone();
            tokio::spawn(async move {
                if let Err(e) = coding.resume(&thread, value).await {
                    warn!(thread_id = %thread, error = %e, "coding resume failed");
                }
            });
            (StatusCode::ACCEPTED, Json(json!({"status": "resumed"})))
        }
        other => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("unknown run kind {other}")})),
        ),
    }
}

/// Safety-net polling: is this thread paused, and on what?
async fn status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.checkpoints.get(&thread_id).await {
        Ok(Some(cp)) => {
            let interrupt: Value = serde_json::to_value(&cp.interrupt).unwrap_or(Value::Null);
            Json(json!({
                "threadId": thread_id,
                "status": "paused",
                "runKind": cp.run_kind,
                "interrupt": interrupt,
                "pausedAt": cp.created_at,
            }))
        }
        Ok(None) => Json(json!({"threadId": thread_id, "status": "not_paused"})),
        Err(e) => Json(json!({"threadId": thread_id, "status": "error", "error": e.to_string()})),
    }
}
