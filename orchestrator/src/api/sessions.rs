//! Session execution endpoints
//!
//! Handlers validate the path, forward one message to the session actor and
//! map typed results onto status codes. Conflicts that are part of normal
//! operation (invalid transition, lease held) keep their operation-specific
//! body shape; everything else uses `ApiError`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shared_types::{
    AcquireLeaseRequest, AcquireLeaseResponse, ApiError, CompleteExecutionRequest,
    EnqueueExecutionRequest, EnqueueExecutionResponse, ExecutionPayload, LeaseTokenRequest,
    LeaseTokenResponse, StartExecutionRequest, StartExecutionResponse, UpdateStatusRequest,
    UpdateStatusResponse, CODE_ALREADY_HELD, CODE_BAD_REQUEST, CODE_INTERNAL_ERROR,
    CODE_INVALID_TRANSITION, CODE_NOT_FOUND,
};

use crate::actors::session::{SessionError, SessionKey, SessionMsg, StatusUpdate};
use crate::api::ApiState;
use crate::store::leases::LeaseAcquisition;

fn status_for_code(code: &str) -> StatusCode {
    match code {
        CODE_NOT_FOUND => StatusCode::NOT_FOUND,
        CODE_BAD_REQUEST => StatusCode::BAD_REQUEST,
        CODE_INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    }
}

fn error_response(code: &str, message: impl Into<String>) -> Response {
    (
        status_for_code(code),
        Json(ApiError {
            code: code.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn session_error(key: Option<&SessionKey>, err: SessionError) -> Response {
    if matches!(
        err,
        SessionError::Store(_) | SessionError::ActorUnavailable(_)
    ) {
        tracing::error!(
            session = %key.map(ToString::to_string).unwrap_or_default(),
            error = %err,
            "Session request failed"
        );
    }
    error_response(err.code(), err.public_message())
}

fn bad_json(rejection: JsonRejection) -> Response {
    error_response(CODE_BAD_REQUEST, rejection.body_text())
}

fn session_key(owner_id: String, session_id: String) -> Result<SessionKey, Response> {
    SessionKey::new(owner_id, session_id).map_err(|e| session_error(None, e))
}

/// PUT /sessions/{owner_id}/{session_id}/prepare
pub async fn prepare_session(
    State(state): State<ApiState>,
    Path((owner_id, session_id)): Path<(String, String)>,
    payload: Result<Json<ExecutionPayload>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::PrepareSession { payload, reply })
        .await
    {
        Ok(Ok(prepared)) => (StatusCode::OK, Json(prepared)).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/start
pub async fn start_execution(
    State(state): State<ApiState>,
    Path((owner_id, session_id)): Path<(String, String)>,
    request: Result<Json<StartExecutionRequest>, JsonRejection>,
) -> Response {
    let failed = |e: SessionError| {
        (
            status_for_code(e.code()),
            Json(StartExecutionResponse::failed(e.code(), e.public_message())),
        )
            .into_response()
    };

    let key = match SessionKey::new(owner_id, session_id) {
        Ok(key) => key,
        Err(e) => return failed(e),
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return failed(SessionError::BadRequest(rejection.body_text())),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::StartExecution { request, reply })
        .await
    {
        Ok(response) => {
            let status = response
                .code
                .as_deref()
                .map(status_for_code)
                .unwrap_or(StatusCode::OK);
            (status, Json(response)).into_response()
        }
        Err(e) => {
            tracing::error!(session = %key, error = %e, "Start execution failed");
            failed(e)
        }
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions
pub async fn enqueue_execution(
    State(state): State<ApiState>,
    Path((owner_id, session_id)): Path<(String, String)>,
    request: Result<Json<EnqueueExecutionRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::EnqueueExecution {
            execution_id: request.execution_id,
            payload: request.payload,
            start_immediately: request.start_immediately,
            reply,
        })
        .await
    {
        Ok(Ok(outcome)) => (
            StatusCode::OK,
            Json(EnqueueExecutionResponse {
                status: outcome.status,
                execution: outcome.execution,
            }),
        )
            .into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// GET /sessions/{owner_id}/{session_id}/executions/{execution_id}
pub async fn get_execution(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let lookup_id = execution_id.clone();
    match state
        .registry
        .ask(&key, |reply| SessionMsg::GetExecution {
            execution_id: lookup_id,
            reply,
        })
        .await
    {
        Ok(Ok(Some(execution))) => (StatusCode::OK, Json(execution)).into_response(),
        Ok(Ok(None)) => error_response(
            CODE_NOT_FOUND,
            format!("execution {execution_id} not found"),
        ),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/status
pub async fn update_execution_status(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
    request: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::UpdateExecutionStatus {
            execution_id,
            status: request.status,
            reply,
        })
        .await
    {
        Ok(Ok(StatusUpdate::Applied {
            execution,
            next_execution_id,
        })) => (
            StatusCode::OK,
            Json(UpdateStatusResponse {
                ok: true,
                error: None,
                current_status: Some(execution.status),
                next_execution_id,
            }),
        )
            .into_response(),
        Ok(Ok(StatusUpdate::Rejected { current })) => (
            StatusCode::CONFLICT,
            Json(UpdateStatusResponse {
                ok: false,
                error: Some(CODE_INVALID_TRANSITION.to_string()),
                current_status: Some(current),
                next_execution_id: None,
            }),
        )
            .into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/complete
pub async fn complete_execution(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
    request: Result<Json<CompleteExecutionRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::ExecutionComplete {
            execution_id,
            outcome: request.outcome,
            reply,
        })
        .await
    {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/cancel
pub async fn cancel_execution(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::CancelExecution {
            execution_id,
            reply,
        })
        .await
    {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/lease
pub async fn acquire_lease(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
    request: Result<Json<AcquireLeaseRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::AcquireLease {
            execution_id,
            request_id: request.request_id,
            holder_token: request.holder_token,
            reply,
        })
        .await
    {
        Ok(Ok(LeaseAcquisition::Acquired { expires_at })) => (
            StatusCode::OK,
            Json(AcquireLeaseResponse {
                acquired: true,
                expires_at: Some(expires_at),
                error: None,
                holder: None,
            }),
        )
            .into_response(),
        Ok(Ok(LeaseAcquisition::AlreadyHeld { holder })) => (
            StatusCode::CONFLICT,
            Json(AcquireLeaseResponse {
                acquired: false,
                expires_at: None,
                error: Some(CODE_ALREADY_HELD.to_string()),
                holder: Some(holder),
            }),
        )
            .into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/lease/extend
pub async fn extend_lease(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
    request: Result<Json<LeaseTokenRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::ExtendLease {
            execution_id,
            holder_token: request.holder_token,
            reply,
        })
        .await
    {
        Ok(Ok(ok)) => (StatusCode::OK, Json(LeaseTokenResponse { ok })).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// POST /sessions/{owner_id}/{session_id}/executions/{execution_id}/lease/release
pub async fn release_lease(
    State(state): State<ApiState>,
    Path((owner_id, session_id, execution_id)): Path<(String, String, String)>,
    request: Result<Json<LeaseTokenRequest>, JsonRejection>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_json(rejection),
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::ReleaseLease {
            execution_id,
            holder_token: request.holder_token,
            reply,
        })
        .await
    {
        Ok(Ok(ok)) => (StatusCode::OK, Json(LeaseTokenResponse { ok })).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}

/// GET /sessions/{owner_id}/{session_id}/queue
pub async fn queue_snapshot(
    State(state): State<ApiState>,
    Path((owner_id, session_id)): Path<(String, String)>,
) -> Response {
    let key = match session_key(owner_id, session_id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match state
        .registry
        .ask(&key, |reply| SessionMsg::QueueSnapshot { reply })
        .await
    {
        Ok(Ok(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(Err(e)) | Err(e) => session_error(Some(&key), e),
    }
}
