use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use shared_types::{Commands, SafeModeReport};
use tracing::{error, info};

use crate::{
    dispatch::{DispatchError, DispatchQueue, SessionFactory},
    AppState,
};

/// Reporter name for commands received over REST.
pub const REST_API_REPORTER: &str = "RestAPI";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("method '{0}' not allowed")]
    MethodNotAllowed(Method),
    #[error("{0}")]
    Body(#[from] serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("safe-mode tracker is not accepting reports")]
    TrackerClosed,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(_) | ApiError::TrackerClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/triggerAction", any(trigger_action))
        .route("/v1/safeMode", any(safe_mode))
        .with_state(state)
}

/// POST /v1/triggerAction — submit commands as if received from the control plane
pub async fn trigger_action(
    method: Method,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed(method));
    }
    handle_action_request(&state.sessions, &state.dispatch, &body)
        .await
        .inspect_err(|e| error!(error = %e, "triggerAction failed"))?;
    Ok("ok")
}

/// POST /v1/safeMode — hand a safe-mode report to the tracker
pub async fn safe_mode(
    method: Method,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed(method));
    }
    let report: SafeModeReport = serde_json::from_slice(&body)?;
    info!(
        reporter = %report.reporter,
        wlid = %report.wlid,
        instance = %report.instance_id,
        status_code = report.status_code,
        "safe-mode report received"
    );
    state
        .safe_mode_reports
        .send(report)
        .await
        .map_err(|_| ApiError::TrackerClosed)?;
    Ok("ok")
}

/// Queue every named command. Commands without a name get an error report
/// and are skipped. Returns the number of commands queued.
pub async fn handle_action_request(
    sessions: &SessionFactory,
    dispatch: &DispatchQueue,
    body: &[u8],
) -> Result<usize, ApiError> {
    let commands: Commands = serde_json::from_slice(body)?;
    info!(commands = %redacted(&commands), "restAPI received commands");

    let mut queued = 0;
    for command in commands.commands {
        let lineage = command.job_tracking.clone();
        let session = sessions
            .session(
                command,
                REST_API_REPORTER,
                &lineage.parent_id,
                &lineage.job_id,
                lineage.last_action_number.saturating_add(1),
            )
            .with_error_channel();
        if session.command.name.is_empty() {
            let err = format!("command not found. id: {}", session.command.id());
            error!(job_id = %session.job_id(), "{err}");
            session.reporter.send_error(&err).await;
            continue;
        }
        dispatch.submit(session).await?;
        queued += 1;
    }
    Ok(queued)
}

/// Commands rendered for logging with their args blanked; args may hold
/// credentials.
fn redacted(commands: &Commands) -> String {
    let mut commands = commands.clone();
    for command in &mut commands.commands {
        command.args.clear();
    }
    serde_json::to_string(&commands).unwrap_or_default()
}
