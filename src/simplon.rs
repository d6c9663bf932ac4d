//! SIMPLON detector-API client.
//!
//! The detector exposes an HTTP control API whose URL layout varies by
//! firmware generation, so every operation walks a short list of candidate
//! paths (versioned, version-prefixed, unversioned) until something other
//! than 404 answers. The status poller normalizes module states into the
//! vocabulary shown in the UI; command dispatch is fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EndpointUpdate;
use crate::status::StatusBoard;

/// Request timeout for status polling.
const POLL_TIMEOUT: Duration = Duration::from_millis(900);
/// Request timeout for commands and config access.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Candidate URL shapes for `<module>/<kind>/<param>`.
pub fn candidate_paths(
    base_url: &str,
    api_version: &str,
    module: &str,
    kind: &str,
    param: &str,
) -> Vec<String> {
    let base_url = base_url.trim_end_matches('/');
    let api_version = api_version.trim_matches('/');
    let module = module.trim_matches('/');
    let kind = kind.trim_matches('/');
    let param = param.trim_start_matches('/');
    if base_url.is_empty() || module.is_empty() || kind.is_empty() || param.is_empty() {
        return Vec::new();
    }

    let mut paths = Vec::with_capacity(3);
    if !api_version.is_empty() {
        paths.push(format!("{base_url}/{module}/api/{api_version}/{kind}/{param}"));
        paths.push(format!("{base_url}/api/{api_version}/{module}/{kind}/{param}"));
    }
    paths.push(format!("{base_url}/{module}/{kind}/{param}"));
    paths
}

/// Poll detector/stream/filewriter/monitor states onto the status board.
///
/// Reacts to endpoint updates by switching base URL mid-flight; while the
/// base URL is empty (no detector configured) the task just waits.
pub async fn poll_task(
    token: CancellationToken,
    api_version: String,
    interval: Duration,
    mut endpoint_rx: watch::Receiver<EndpointUpdate>,
    status: Arc<StatusBoard>,
) {
    let client = match reqwest::Client::builder().timeout(POLL_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            debug!(error = %err, "simplon poll client unavailable");
            return;
        }
    };
    let mut base_url = endpoint_rx.borrow().simplon_base_url.clone();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            changed = endpoint_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                base_url = endpoint_rx.borrow_and_update().simplon_base_url.clone();
            }
            _ = ticker.tick() => {
                if base_url.is_empty() {
                    continue;
                }
                let detector =
                    fetch_with_fallback(&client, &format!("{base_url}/detector"), &api_version).await;
                let stream =
                    fetch_with_fallback(&client, &format!("{base_url}/stream"), &api_version).await;
                let filewriter =
                    fetch_with_fallback(&client, &format!("{base_url}/filewriter"), &api_version).await;
                let monitor =
                    fetch_with_fallback(&client, &format!("{base_url}/monitor"), &api_version).await;
                status.set_module_states(detector, stream, filewriter, monitor);
            }
        }
    }
}

async fn fetch_with_fallback(client: &reqwest::Client, base: &str, api_version: &str) -> String {
    let api_version = api_version.trim_matches('/');
    let mut paths = Vec::with_capacity(4);
    if !api_version.is_empty() {
        paths.push(format!("{base}/api/{api_version}/status/state"));
    }
    paths.push(format!("{base}/status/state"));
    if !api_version.is_empty() {
        paths.push(format!("{base}/api/{api_version}/status"));
    }
    paths.push(format!("{base}/status"));

    for path in paths {
        let state = fetch_status(client, &path).await;
        if !state.starts_with("http_404") {
            return state;
        }
    }
    "http_404".to_string()
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> String {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(_) => return "error".to_string(),
    };
    let code = response.status();
    if code != reqwest::StatusCode::OK {
        return format!("http_{}", code.as_u16());
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(_) => return "error".to_string(),
    };
    if body.is_empty() {
        return "ok".to_string();
    }
    match serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| find_state(&v))
    {
        Some(state) => state.to_ascii_lowercase(),
        None => "ok".to_string(),
    }
}

/// Search `state` / `status` / `value` keys recursively for a state string.
fn find_state(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["state", "status", "value"] {
                if let Some(entry) = map.get(key) {
                    match entry {
                        Value::String(s) => return Some(s.clone()),
                        nested => {
                            if let Some(state) = find_state(nested) {
                                return Some(state);
                            }
                        }
                    }
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_state),
        _ => None,
    }
}

/// Fire-and-forget PUT of a command, walking the candidate paths.
pub fn command_async(base_url: &str, api_version: &str, module: &str, command: &str) {
    let paths = candidate_paths(base_url, api_version, module, "command", command);
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(COMMAND_TIMEOUT).build() {
            Ok(client) => client,
            Err(_) => return,
        };
        for path in paths {
            match client.put(&path).send().await {
                Ok(response) if response.status() != reqwest::StatusCode::NOT_FOUND => return,
                _ => continue,
            }
        }
    });
}

/// PUT `{"value": ...}` to a config parameter. Returns status and body of
/// the first non-404 answer.
pub async fn config_set(
    base_url: &str,
    api_version: &str,
    module: &str,
    param: &str,
    value: &Value,
) -> (u16, String) {
    let paths = candidate_paths(base_url, api_version, module, "config", param);
    do_request(reqwest::Method::PUT, paths, Some(json!({ "value": value }))).await
}

/// GET a config parameter.
pub async fn config_get(
    base_url: &str,
    api_version: &str,
    module: &str,
    param: &str,
) -> (u16, String) {
    let paths = candidate_paths(base_url, api_version, module, "config", param);
    do_request(reqwest::Method::GET, paths, None).await
}

/// GET a status parameter.
pub async fn status_get(
    base_url: &str,
    api_version: &str,
    module: &str,
    param: &str,
) -> (u16, String) {
    let paths = candidate_paths(base_url, api_version, module, "status", param);
    do_request(reqwest::Method::GET, paths, None).await
}

async fn do_request(method: reqwest::Method, paths: Vec<String>, body: Option<Value>) -> (u16, String) {
    if paths.is_empty() {
        return (400, "missing path".to_string());
    }
    let client = match reqwest::Client::builder().timeout(COMMAND_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => return (500, err.to_string()),
    };
    for path in paths {
        let mut request = client.request(method.clone(), &path);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(_) => continue,
        };
        let code = response.status().as_u16();
        if code == 404 {
            continue;
        }
        let body = response.text().await.unwrap_or_default();
        return (code, body.trim().to_string());
    }
    (404, "not found".to_string())
}
