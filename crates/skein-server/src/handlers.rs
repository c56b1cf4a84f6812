use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{info, warn};

use skein_core::ids::{ApprovalId, ChannelId, RunId, SessionId};
use skein_engine::approval::{ApprovalGate, GateConfig};
use skein_engine::channel::{ChannelConfig, ChannelManager};
use skein_engine::coordinator::{CreateSessionOptions, SessionCoordinator};
use skein_engine::error::EngineError;
use skein_engine::executor::PhaseExecutor;
use skein_engine::registry::WorkflowRegistry;
use skein_store::events::EventRepo;
use skein_store::sessions::SessionFilter;
use skein_store::{Database, StoreError};

use crate::client::{ClientId, ClientRegistry};
use crate::rpc::{self, optional_i64, optional_str, require_str, RpcResponse};

/// Shared state behind every RPC method.
pub struct HandlerState {
    pub coordinator: Arc<SessionCoordinator>,
    pub channels: Arc<ChannelManager>,
    pub gate: Arc<ApprovalGate>,
    pub executor: Arc<PhaseExecutor>,
    pub workflows: Arc<WorkflowRegistry>,
    events: EventRepo,
    started_at: Instant,
}

impl HandlerState {
    pub fn new(db: Database, workflows: Arc<WorkflowRegistry>) -> Self {
        let coordinator = Arc::new(SessionCoordinator::new(db.clone()));
        let channels = Arc::new(ChannelManager::new(db.clone(), ChannelConfig::default()));
        let gate = Arc::new(ApprovalGate::new(
            db.clone(),
            Arc::clone(&channels),
            GateConfig::default(),
        ));
        let executor = Arc::new(PhaseExecutor::new(
            Arc::clone(&coordinator),
            Arc::clone(&channels),
            Arc::clone(&gate),
        ));
        Self {
            coordinator,
            channels,
            gate,
            executor,
            workflows,
            events: EventRepo::new(db),
            started_at: Instant::now(),
        }
    }
}

/// Connection context for WebSocket-native methods.
pub struct ClientLink<'a> {
    pub client_id: &'a ClientId,
    pub registry: &'a ClientRegistry,
}

/// Route one RPC request. `client` is present only for requests arriving
/// over a WebSocket.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &Value,
    id: Option<Value>,
    client: Option<&ClientLink<'_>>,
) -> RpcResponse {
    match method {
        "health" => health(state, id),
        "session.create" => session_create(state, params, id),
        "session.list" => session_list(state, params, id),
        "session.status" => session_status(state, params, id),
        "session.suspend" => session_transition(state, params, id, Transition::Suspend),
        "session.resume" => session_transition(state, params, id, Transition::Resume),
        "session.complete" => session_transition(state, params, id, Transition::Complete),
        "session.delete" => session_delete(state, params, id),
        "workflow.start" => workflow_start(state, params, id),
        "run.status" => run_status(state, params, id),
        "approval.resolve" => approval_resolve(state, params, id),
        "events.replay" => events_replay(state, params, id),
        "run.subscribe" => run_subscribe(state, params, id, client).await,
        "run.ack" => run_ack(state, params, id),
        _ => RpcResponse::method_not_found(id, method),
    }
}

fn engine_error(id: Option<Value>, e: EngineError) -> RpcResponse {
    let code = match &e {
        EngineError::Store(StoreError::NotFound(_)) => "NOT_FOUND",
        EngineError::Store(StoreError::ConcurrencyConflict { .. }) => "CONFLICT",
        EngineError::Store(_) => rpc::INTERNAL_ERROR,
        EngineError::NotSuspendable { .. } => "INVALID_STATE",
        EngineError::Validation { .. } => "VALIDATION_ERROR",
        EngineError::AlreadyResolved(_) => "ALREADY_RESOLVED",
        EngineError::ApprovalExpired(_) => "APPROVAL_EXPIRED",
        EngineError::ApprovalTimeout(_) => "APPROVAL_TIMEOUT",
        EngineError::UnknownResolution(_) => "UNKNOWN_RESOLUTION",
        EngineError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
        EngineError::PhaseFailed { .. } => "PHASE_FAILED",
        EngineError::Cancelled => "CANCELLED",
        EngineError::Internal(_) => rpc::INTERNAL_ERROR,
    };
    RpcResponse::error(id, code, e.to_string())
}

fn to_json<T: serde::Serialize>(id: &Option<Value>, value: &T) -> Result<Value, RpcResponse> {
    serde_json::to_value(value)
        .map_err(|e| RpcResponse::error(id.clone(), rpc::INTERNAL_ERROR, e.to_string()))
}

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "modes": state.workflows.modes(),
        }),
    )
}

fn session_create(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let mode = match require_str(params, "mode") {
        Ok(m) => m,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    if state.workflows.get(mode).is_none() {
        return RpcResponse::invalid_params(id, format!("Unknown workflow mode: {mode}"));
    }

    let options = CreateSessionOptions {
        name: optional_str(params, "name").unwrap_or(mode).to_string(),
        owner_id: optional_str(params, "owner_id").map(str::to_string),
    };
    match state.coordinator.create(mode, options) {
        Ok(session) => match to_json(&id, &session) {
            Ok(value) => RpcResponse::success(id, json!({ "session": value })),
            Err(resp) => resp,
        },
        Err(e) => engine_error(id, e),
    }
}

fn session_list(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let mut filter = SessionFilter::default();
    if let Some(raw) = optional_str(params, "status") {
        match raw.parse() {
            Ok(status) => filter.status = Some(status),
            Err(e) => return RpcResponse::invalid_params(id, e),
        }
    }
    filter.owner_id = optional_str(params, "owner_id").map(str::to_string);
    filter.limit = optional_i64(params, "limit").unwrap_or(0).max(0) as u32;
    filter.offset = optional_i64(params, "offset").unwrap_or(0).max(0) as u32;

    match state.coordinator.list(&filter) {
        Ok(sessions) => match to_json(&id, &sessions) {
            Ok(value) => RpcResponse::success(id, json!({ "sessions": value })),
            Err(resp) => resp,
        },
        Err(e) => engine_error(id, e),
    }
}

fn session_status(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let session = match state.coordinator.status(&session_id) {
        Ok(s) => s,
        Err(e) => return engine_error(id, e),
    };
    let (context, version) = match state.coordinator.load_state(&session_id) {
        Ok(pair) => pair,
        Err(e) => return engine_error(id, e),
    };

    let session_value = match to_json(&id, &session) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    RpcResponse::success(
        id,
        json!({
            "session": session_value,
            "state": {
                "version": version,
                "current_phase": context.current_phase,
                "step_index": context.step_index,
                "variables": context.variables,
                "shared_keys": context.shared_keys,
            },
        }),
    )
}

enum Transition {
    Suspend,
    Resume,
    Complete,
}

fn session_transition(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
    transition: Transition,
) -> RpcResponse {
    let session_id = match require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // Resume also hands back the state the next run will continue from.
    let resumed = match transition {
        Transition::Suspend => match state.coordinator.suspend(&session_id) {
            Ok(()) => None,
            Err(e) => return engine_error(id, e),
        },
        Transition::Resume => match state.coordinator.resume(&session_id) {
            Ok(pair) => Some(pair),
            Err(e) => return engine_error(id, e),
        },
        Transition::Complete => match state.coordinator.complete(&session_id) {
            Ok(()) => None,
            Err(e) => return engine_error(id, e),
        },
    };

    let session = match state.coordinator.status(&session_id) {
        Ok(session) => session,
        Err(e) => return engine_error(id, e),
    };
    let session_value = match to_json(&id, &session) {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    let mut body = json!({ "session": session_value });
    if let Some((context, version)) = resumed {
        body["state"] = json!({
            "version": version,
            "current_phase": context.current_phase,
            "step_index": context.step_index,
            "variables": context.variables,
            "shared_keys": context.shared_keys,
        });
    }
    RpcResponse::success(id, body)
}

fn session_delete(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // The gate cancels first so parked waiters wake with `Cancelled`; the
    // coordinator then cascades the soft delete.
    let mut cancelled = match state.gate.cancel_for_session(&session_id) {
        Ok(ids) => ids,
        Err(e) => return engine_error(id, e),
    };
    match state.coordinator.delete(&session_id) {
        Ok(more) => cancelled.extend(more),
        Err(e) => return engine_error(id, e),
    }

    let cancelled: Vec<&str> = cancelled.iter().map(|a| a.as_str()).collect();
    RpcResponse::success(
        id,
        json!({ "deleted": true, "cancelled_approvals": cancelled }),
    )
}

fn workflow_start(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let session = match state.coordinator.status(&session_id) {
        Ok(s) => s,
        Err(e) => return engine_error(id, e),
    };

    let mode = optional_str(params, "mode").unwrap_or(&session.mode).to_string();
    let Some(phases) = state.workflows.get(&mode) else {
        return RpcResponse::invalid_params(id, format!("Unknown workflow mode: {mode}"));
    };

    let seed: Option<BTreeMap<String, Value>> = params
        .get("inputs")
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

    let run = match state.coordinator.start_run(&session_id, &mode, None) {
        Ok(run) => run,
        Err(e) => return engine_error(id, e),
    };

    let executor = Arc::clone(&state.executor);
    let run_for_task = run.clone();
    tokio::spawn(async move {
        // Failures are already evented and recorded on the run row.
        if let Err(e) = executor.execute(&run_for_task, &phases, seed.as_ref()).await {
            warn!(run_id = %run_for_task.id, error = %e, "workflow run halted");
        }
    });

    info!(session_id = %session_id, run_id = %run.id, mode, "workflow started");
    RpcResponse::success(
        id,
        json!({
            "run_id": run.id.as_str(),
            "session_id": session_id.as_str(),
            "mode": mode,
        }),
    )
}

fn run_status(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let run_id = match require_str(params, "run_id") {
        Ok(s) => RunId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let run = match state.coordinator.run(&run_id) {
        Ok(run) => run,
        Err(e) => return engine_error(id, e),
    };
    let event_count = match state.events.count(&run_id) {
        Ok(n) => n,
        Err(e) => return engine_error(id, e.into()),
    };

    match to_json(&id, &run) {
        Ok(value) => RpcResponse::success(id, json!({ "run": value, "event_count": event_count })),
        Err(resp) => resp,
    }
}

fn approval_resolve(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let approval_id = match require_str(params, "approval_id") {
        Ok(s) => ApprovalId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let decision = match require_str(params, "decision") {
        Ok(d) => d,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let feedback = optional_str(params, "feedback");

    match state.gate.resolve(&approval_id, decision, feedback) {
        Ok(resolution) => match to_json(&id, &resolution) {
            Ok(value) => RpcResponse::success(id, json!({ "resolution": value })),
            Err(resp) => resp,
        },
        Err(e) => engine_error(id, e),
    }
}

fn events_replay(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let run_id = match require_str(params, "run_id") {
        Ok(s) => RunId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let from_sequence = optional_i64(params, "from_sequence").unwrap_or(-1);

    match state.channels.replay(&run_id, from_sequence) {
        Ok(events) => match to_json(&id, &events) {
            Ok(value) => RpcResponse::success(
                id,
                json!({ "events": value, "count": events.len() }),
            ),
            Err(resp) => resp,
        },
        Err(e) => engine_error(id, e),
    }
}

/// Bridge this client's socket into the run's event channel: backlog first
/// via replay, then live pushes. Live pushes may overlap the backlog;
/// clients deduplicate by sequence number.
async fn run_subscribe(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
    client: Option<&ClientLink<'_>>,
) -> RpcResponse {
    let run_id = match require_str(params, "run_id") {
        Ok(s) => RunId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(link) = client else {
        return RpcResponse::error(
            id,
            rpc::INVALID_REQUEST,
            "run.subscribe requires a WebSocket connection",
        );
    };
    if let Err(e) = state.coordinator.run(&run_id) {
        return engine_error(id, e);
    }
    let Some(tx) = link.registry.sender(link.client_id) else {
        return RpcResponse::error(id, rpc::INTERNAL_ERROR, "client connection gone");
    };

    let from_sequence = optional_i64(params, "from_sequence").unwrap_or(-1);
    let channel_id = match state.channels.register(&run_id, tx.clone()) {
        Ok(c) => c,
        Err(e) => return engine_error(id, e),
    };

    let backlog = match state.channels.replay(&run_id, from_sequence) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = state.channels.unregister(&run_id, &channel_id);
            return engine_error(id, e);
        }
    };
    let replayed = backlog.len();
    for row in &backlog {
        let message = json!({ "method": "run.event", "params": row }).to_string();
        let _ = tx.send(message).await;
    }

    link.registry
        .add_subscription(link.client_id, run_id.clone(), channel_id.clone());
    RpcResponse::success(
        id,
        json!({
            "channel_id": channel_id.as_str(),
            "replayed": replayed,
        }),
    )
}

fn run_ack(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let channel_id = match require_str(params, "channel_id") {
        Ok(s) => ChannelId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(sequence) = optional_i64(params, "sequence") else {
        return RpcResponse::invalid_params(id, "Missing required parameter: sequence");
    };

    match state.channels.ack(&channel_id, sequence) {
        Ok(()) => RpcResponse::success(id, json!({ "acknowledged": sequence })),
        Err(e) => engine_error(id, e),
    }
}
