//! HTTP front end over any [`Store`].
//!
//! Store calls block until a log entry applies, so every handler that may
//! propose runs its call on the blocking pool. A `NotLeader` result is turned
//! into a redirect to the same path and query on the leader's HTTP address.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::NodeId;
use crate::error::StoreError;
use crate::membership::JoinRequest;
use crate::store::{ConsistencyLevel, Store};

/// Builds the router serving `store`.
pub fn router<S: Store>(store: Arc<S>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats::<S>))
        .route("/data", get(data::<S>))
        .route("/key", post(set_keys::<S>))
        .route("/key/:key", get(get_key::<S>).delete(delete_key::<S>))
        .route("/join", post(join::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    BadRequest(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

/// Maps an error to its response; needs the store to resolve redirects.
fn error_response<S: Store>(store: &S, uri: &Uri, err: ApiError) -> Response {
    match err {
        ApiError::Store(StoreError::NotLeader) => match store.leader_api_addr() {
            Some(leader) => {
                let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                let location = format!("http://{leader}{path}");
                debug!(%location, "redirecting to leader");
                Redirect::temporary(&location).into_response()
            }
            None => (StatusCode::SERVICE_UNAVAILABLE, "no leader available").into_response(),
        },
        ApiError::Store(err @ StoreError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, err.to_string()).into_response()
        }
        ApiError::Store(err @ StoreError::Configuration(_)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        ApiError::Store(err @ StoreError::ChangeInProgress) => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        ApiError::Store(err) => {
            warn!(error = %err, path = %uri.path(), "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        ApiError::Internal(message) => {
            warn!(error = %message, path = %uri.path(), "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

/// Runs a blocking store call off the async executor.
async fn blocking<S, T, F>(store: &Arc<S>, call: F) -> Result<T, ApiError>
where
    S: Store,
    T: Send + 'static,
    F: FnOnce(&S) -> crate::error::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|err| ApiError::Internal(format!("store task failed: {err}")))?
        .map_err(ApiError::Store)
}

async fn ping() -> &'static str {
    "pong"
}

async fn stats<S: Store>(State(store): State<Arc<S>>) -> Response {
    Json(store.stats()).into_response()
}

async fn data<S: Store>(State(store): State<Arc<S>>) -> Response {
    Json(store.data()).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct LevelQuery {
    level: Option<String>,
}

async fn get_key<S: Store>(
    State(store): State<Arc<S>>,
    Path(key): Path<String>,
    Query(query): Query<LevelQuery>,
    uri: Uri,
) -> Response {
    let level = ConsistencyLevel::parse_or_default(query.level.as_deref());
    let lookup = key.clone();
    match blocking(&store, move |s| s.get(&lookup, level)).await {
        Ok(Some(value)) => Json(BTreeMap::from([(key, value)])).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("key {key:?} not found")).into_response(),
        Err(err) => error_response(store.as_ref(), &uri, err),
    }
}

async fn set_keys<S: Store>(State(store): State<Arc<S>>, uri: Uri, body: Bytes) -> Response {
    let pairs: BTreeMap<String, String> = match serde_json::from_slice(&body) {
        Ok(pairs) => pairs,
        Err(err) => {
            let err = ApiError::BadRequest(format!("expected a JSON object of strings: {err}"));
            return error_response(store.as_ref(), &uri, err);
        }
    };
    let result = blocking(&store, move |s| {
        for (key, value) in &pairs {
            s.set(key, value)?;
        }
        Ok(())
    })
    .await;
    match result {
        Ok(()) => (StatusCode::OK, "Set data success").into_response(),
        Err(err) => error_response(store.as_ref(), &uri, err),
    }
}

async fn delete_key<S: Store>(
    State(store): State<Arc<S>>,
    Path(key): Path<String>,
    uri: Uri,
) -> Response {
    let target = key.clone();
    match blocking(&store, move |s| s.delete(&target)).await {
        Ok(()) => (StatusCode::OK, format!("Key: {key} is deleted")).into_response(),
        Err(err) => error_response(store.as_ref(), &uri, err),
    }
}

/// Node ids arrive either as JSON numbers or as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeIdField {
    Number(NodeId),
    Text(String),
}

impl NodeIdField {
    fn parse(self) -> Result<NodeId, ApiError> {
        match self {
            NodeIdField::Number(id) => Ok(id),
            NodeIdField::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("invalid node id {text:?}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JoinBody {
    http_addr: String,
    raft_addr: String,
    id: NodeIdField,
}

impl JoinBody {
    fn into_request(self) -> Result<JoinRequest, ApiError> {
        let node_id = self.id.parse()?;
        let request = JoinRequest::new(node_id, self.http_addr, self.raft_addr);
        request.validate()?;
        Ok(request)
    }
}

async fn join<S: Store>(State(store): State<Arc<S>>, uri: Uri, body: Bytes) -> Response {
    let request = serde_json::from_slice::<JoinBody>(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid join request: {err}")))
        .and_then(JoinBody::into_request);
    let request = match request {
        Ok(request) => request,
        Err(err) => return error_response(store.as_ref(), &uri, err),
    };
    match blocking(&store, move |s| s.join(&request)).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(store.as_ref(), &uri, err),
    }
}

/// Asks the node at `join_addr` to add this node to its cluster.
///
/// Redirects from followers are followed to the leader.
pub async fn request_join(
    join_addr: &str,
    http_addr: &str,
    raft_addr: &str,
    node_id: NodeId,
) -> anyhow::Result<()> {
    let url = format!("http://{join_addr}/join");
    let body = serde_json::json!({
        "httpAddr": http_addr,
        "raftAddr": raft_addr,
        "id": node_id.to_string(),
    });
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to send join request to {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let reason = response.text().await.unwrap_or_default();
        bail!("join via {join_addr} failed with {status}: {reason}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_body_accepts_string_or_number_ids() {
        let body: JoinBody =
            serde_json::from_str(r#"{"httpAddr":"h:1","raftAddr":"r:1","id":"7"}"#).unwrap();
        assert_eq!(body.into_request().unwrap().node_id, 7);

        let body: JoinBody =
            serde_json::from_str(r#"{"httpAddr":"h:1","raftAddr":"r:1","id":9}"#).unwrap();
        assert_eq!(body.into_request().unwrap().node_id, 9);
    }

    #[test]
    fn join_body_rejects_extra_fields_and_bad_ids() {
        assert!(serde_json::from_str::<JoinBody>(
            r#"{"httpAddr":"h:1","raftAddr":"r:1","id":"1","voter":true}"#
        )
        .is_err());

        let body: JoinBody =
            serde_json::from_str(r#"{"httpAddr":"h:1","raftAddr":"r:1","id":"node-a"}"#).unwrap();
        assert!(matches!(body.into_request(), Err(ApiError::BadRequest(_))));

        let body: JoinBody =
            serde_json::from_str(r#"{"httpAddr":"","raftAddr":"r:1","id":"3"}"#).unwrap();
        assert!(matches!(
            body.into_request(),
            Err(ApiError::Store(StoreError::Configuration(_)))
        ));
    }
}
