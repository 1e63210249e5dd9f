//! JSON control API.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use launchpad_rpc::codec::{json_to_value, value_to_json};
use launchpad_rpc::{Error as RpcError, Params, RemoteException, SessionRegistry};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct ApiState {
    pub(crate) registry: SessionRegistry,
    pub(crate) call_timeout: Duration,
}

/// Body of `POST /clients/{client_id}/call`.
#[derive(Debug, Deserialize)]
pub(crate) struct CallRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
    timeout_ms: Option<u64>,
}

pub(crate) async fn list_clients(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.ids())
}

pub(crate) async fn call_client(
    State(state): State<ApiState>,
    Path(client_id): Path<String>,
    Json(request): Json<CallRequest>,
) -> Response {
    let Some(session) = state.registry.get(&client_id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("client {client_id} is not connected"),
        );
    };

    let params = match params_from_json(request.params) {
        Ok(params) => params,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let timeout = request
        .timeout_ms
        .map_or(state.call_timeout, Duration::from_millis);

    debug!("Calling {} on client {}", request.method, client_id);
    match session
        .call_with_timeout(request.method, params, Some(timeout))
        .await
    {
        Ok(result) => match value_to_json(&result) {
            Ok(result) => (StatusCode::OK, Json(json!({ "result": result }))).into_response(),
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
        },
        Err(RpcError::Remote(exception)) => remote_error_response(&exception),
        Err(e @ RpcError::Timeout { .. }) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, e.to_string())
        }
        Err(e @ (RpcError::Connection(_) | RpcError::Abandoned(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

fn params_from_json(params: serde_json::Value) -> Result<Params, String> {
    match params {
        serde_json::Value::Null => Ok(Params::none()),
        serde_json::Value::Array(args) => {
            Ok(Params::Positional(args.into_iter().map(json_to_value).collect()))
        }
        serde_json::Value::Object(args) => Ok(Params::Named(
            args.into_iter()
                .map(|(name, value)| (name, json_to_value(value)))
                .collect(),
        )),
        _ => Err("params must be an array or an object".to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": { "message": message } }))).into_response()
}

fn remote_error_response(exception: &RemoteException) -> Response {
    let attributes = value_to_json(&exception.attributes_value()).unwrap_or_else(|_| {
        json!({ "message": exception.message() })
    });

    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": {
                "type": exception.kind().type_name(),
                "attributes": attributes,
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_rpc::Value;

    #[test]
    fn test_params_from_json() {
        assert_eq!(params_from_json(serde_json::Value::Null), Ok(Params::none()));
        assert_eq!(
            params_from_json(json!(["/tmp", 1])),
            Ok(Params::Positional(vec![
                Value::Text("/tmp".to_string()),
                Value::Integer(1.into())
            ]))
        );

        let Ok(Params::Named(named)) = params_from_json(json!({ "dir_path": "/tmp" })) else {
            panic!("expected named params");
        };
        assert_eq!(named["dir_path"], Value::Text("/tmp".to_string()));

        assert!(params_from_json(json!("oops")).is_err());
    }
}
