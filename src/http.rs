//! HTTP JSON-RPC dispatcher.
//!
//! Miners POST to `/{login}` or `/{login}/{worker}` and stream a sequence
//! of JSON-RPC objects in the body (long-poll style). The login comes from
//! the URL, lowercased and revalidated per request; HTTP callers have no
//! stratum session, so the submit path skips the subscription check.
//! The same listener exposes `/metrics` and `/healthz`.

use crate::health::HealthState;
use crate::metrics;
use crate::policy::PolicyEngine;
use crate::shares::{Backend, SharePipeline, SubmitOrigin, Submission};
use crate::stratum::protocol::{ErrorReply, RpcResponse, StratumRequest};
use crate::template::TemplateCache;
use crate::util;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<SharePipeline>,
    pub policy: Arc<PolicyEngine>,
    pub cache: Arc<TemplateCache>,
    pub health: Arc<HealthState>,
    pub backend: Arc<dyn Backend>,
    pub diff_hex: String,
    pub limit_headers_size: usize,
    pub limit_body_size: usize,
    pub behind_reverse_proxy: bool,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/:login", post(rpc_without_worker))
        .route("/:login/:worker", post(rpc_with_worker))
        .with_state(state)
}

async fn healthz(State(state): State<HttpState>) -> Response {
    let redis_ok = state.backend.ping().await.is_ok();
    let height = state.cache.current().map(|t| t.height).unwrap_or_default();
    let body = json!({
        "status": if state.health.is_sick() { "sick" } else { "ok" },
        "redis": redis_ok,
        "template_height": height,
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

async fn metrics_endpoint() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
        .into_response()
}

async fn rpc_without_worker(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(login): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_rpc(state, peer, headers, login, None, body).await
}

async fn rpc_with_worker(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((login, worker)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_rpc(state, peer, headers, login, Some(worker), body).await
}

async fn handle_rpc(
    state: HttpState,
    peer: SocketAddr,
    headers: HeaderMap,
    login: String,
    worker: Option<String>,
    body: Body,
) -> Response {
    let ip = remote_ip(state.behind_reverse_proxy, peer.ip(), &headers);
    if state.policy.is_banned(&ip) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let header_bytes: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    if header_bytes > state.limit_headers_size {
        state.policy.apply_malformed_policy(&ip);
        return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into_response();
    }

    // URL shape gate, the router has no regex constraints.
    if !is_route_login(&login) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(worker) = &worker {
        if util::sanitize_worker(worker) == "0" && worker != "0" {
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let bytes = match to_bytes(body, state.limit_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::warn!(ip = %ip, "http body over limit");
            state.policy.apply_malformed_policy(&ip);
            return (StatusCode::EXPECTATION_FAILED, "Request too large").into_response();
        }
    };

    let login = login.to_lowercase();
    let out = run_requests(&state, &ip, &login, worker.as_deref(), &bytes).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        out,
    )
        .into_response()
}

fn is_route_login(segment: &str) -> bool {
    segment.len() == 42
        && segment.starts_with("0x")
        && segment[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn remote_ip(behind_reverse_proxy: bool, peer: IpAddr, headers: &HeaderMap) -> String {
    if behind_reverse_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
        {
            if forwarded.parse::<IpAddr>().is_ok() {
                return forwarded.to_string();
            }
        }
    }
    peer.to_string()
}

/// Decodes the body as a stream of JSON-RPC objects; one reply line per
/// request. A decode failure ticks the malformed policy and stops.
async fn run_requests(
    state: &HttpState,
    ip: &str,
    login: &str,
    worker: Option<&str>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    let stream = serde_json::Deserializer::from_slice(body).into_iter::<StratumRequest>();
    for item in stream {
        let request = match item {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(ip = %ip, "malformed http rpc request: {}", e);
                state.policy.apply_malformed_policy(ip);
                break;
            }
        };
        match dispatch(state, ip, login, worker, request).await {
            Some(response) => {
                if serde_json::to_writer(&mut out, &response).is_ok() {
                    out.push(b'\n');
                }
            }
            None => break,
        }
    }
    out
}

async fn dispatch(
    state: &HttpState,
    ip: &str,
    login: &str,
    worker: Option<&str>,
    request: StratumRequest,
) -> Option<RpcResponse> {
    if request.id.is_null() {
        state.policy.apply_malformed_policy(ip);
        return None;
    }
    let id = request.id.clone();

    if !util::is_valid_login(login) {
        return Some(RpcResponse::error(id, ErrorReply::invalid_login()));
    }
    if !state.policy.apply_login_policy(login, ip) {
        return Some(RpcResponse::error(id, ErrorReply::blacklisted()));
    }

    let response = match request.method.as_str() {
        "eth_getWork" => match state.cache.current().filter(|t| t.is_ready()) {
            Some(t) if !state.health.is_sick() => {
                RpcResponse::result(id, json!([t.header, t.seed, state.diff_hex]))
            }
            _ => RpcResponse::error(id, ErrorReply::work_not_ready()),
        },
        "eth_submitWork" => {
            let params: Vec<String> = request
                .params
                .as_ref()
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let submission = Submission {
                origin: SubmitOrigin::Http,
                subscribed: false,
                login: login.to_string(),
                worker: worker.unwrap_or("0").to_string(),
                ip: ip.to_string(),
            };
            let (accepted, error) = state.pipeline.submit_work(&submission, &params).await;
            match error {
                Some(reply) => RpcResponse::error(id, reply),
                None => RpcResponse::result(id, json!(accepted)),
            }
        }
        "eth_submitHashrate" => RpcResponse::result(id, json!(true)),
        "eth_getBlockByNumber" => {
            let pending = state
                .cache
                .current()
                .and_then(|t| t.pending_block.clone())
                .unwrap_or(Value::Null);
            RpcResponse::result(id, pending)
        }
        other => {
            tracing::debug!(ip = %ip, method = other, "unknown http method");
            state.policy.apply_malformed_policy(ip);
            RpcResponse::error(id, ErrorReply::method_not_found())
        }
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::shares::pipeline::tests::{
        ready_template, valid_params, RecordingBackend, StubUpstream, StubVerifier, LOGIN,
    };
    use crate::upstream::{UpstreamApi, UpstreamSet};
    use serde_json::Deserializer;

    fn state() -> (HttpState, Arc<StubVerifier>, Arc<RecordingBackend>) {
        let cache = Arc::new(TemplateCache::new());
        let upstream = StubUpstream::new();
        let upstreams = UpstreamSet::new(vec![upstream as Arc<dyn UpstreamApi>]);
        let policy = PolicyEngine::new(PolicyConfig::default(), None);
        let backend = Arc::new(RecordingBackend::default());
        let verifier = StubVerifier::accepting();
        let pipeline = Arc::new(SharePipeline::new(
            cache.clone(),
            upstreams,
            policy.clone(),
            backend.clone(),
            verifier.clone(),
            2000,
        ));
        let health = Arc::new(HealthState::new(true, 100));
        (
            HttpState {
                pipeline,
                policy,
                cache,
                health,
                backend: backend.clone() as Arc<dyn Backend>,
                diff_hex: crate::pow::target_hex(2000),
                limit_headers_size: 1024,
                limit_body_size: 256,
                behind_reverse_proxy: false,
            },
            verifier,
            backend,
        )
    }

    fn parse_replies(out: &[u8]) -> Vec<Value> {
        Deserializer::from_slice(out)
            .into_iter::<Value>()
            .map(|v| v.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn get_work_round_trips_the_published_template() {
        let (state, _, _) = state();
        state.cache.publish(ready_template(&format!("0x{}", "aa".repeat(32)), 3));
        let body = br#"{"id":1,"method":"eth_getWork","params":[]}"#;
        let out = run_requests(&state, "1.2.3.4", LOGIN, None, body).await;
        let replies = parse_replies(&out);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["result"][0], json!(format!("0x{}", "aa".repeat(32))));
        assert_eq!(replies[0]["result"][2], json!(state.diff_hex.clone()));
    }

    #[tokio::test]
    async fn submit_work_bypasses_subscription_and_writes_share() {
        let (state, _, backend) = state();
        let params = valid_params();
        state.cache.publish(ready_template(&params[1], 11));
        let body = format!(
            r#"{{"id":1,"method":"eth_submitWork","params":["{}","{}","{}"]}}"#,
            params[0], params[1], params[2]
        );
        let out = run_requests(&state, "1.2.3.4", LOGIN, Some("rig7"), body.as_bytes()).await;
        let replies = parse_replies(&out);
        assert_eq!(replies[0]["result"], json!(true), "no code-25 on the http path");
        let shares = backend.shares.lock().unwrap();
        assert_eq!(shares[0], (LOGIN.to_string(), "rig7".to_string(), 11));
    }

    #[tokio::test]
    async fn body_can_carry_several_requests() {
        let (state, _, _) = state();
        state.cache.publish(ready_template(&format!("0x{}", "aa".repeat(32)), 3));
        let body = br#"{"id":1,"method":"eth_getWork","params":[]}
{"id":2,"method":"eth_submitHashrate","params":["0x500000","0xabc"]}"#;
        let out = run_requests(&state, "1.2.3.4", LOGIN, None, body).await;
        let replies = parse_replies(&out);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], json!(1));
        assert_eq!(replies[1], json!({"jsonrpc": "2.0", "id": 2, "result": true}));
    }

    #[tokio::test]
    async fn invalid_login_from_url_is_rejected_per_request() {
        let (state, _, _) = state();
        let body = br#"{"id":1,"method":"eth_getWork","params":[]}"#;
        let out = run_requests(&state, "1.2.3.4", "0xnothex", None, body).await;
        let replies = parse_replies(&out);
        assert_eq!(replies[0]["error"]["message"], json!("Invalid login"));
    }

    #[tokio::test]
    async fn pending_block_is_passed_through_opaquely() {
        let (state, _, _) = state();
        let mut template = ready_template(&format!("0x{}", "aa".repeat(32)), 3);
        template.pending_block = Some(json!({"number": "0x3", "transactions": []}));
        state.cache.publish(template);
        let body = br#"{"id":4,"method":"eth_getBlockByNumber","params":["pending",false]}"#;
        let out = run_requests(&state, "1.2.3.4", LOGIN, None, body).await;
        let replies = parse_replies(&out);
        assert_eq!(replies[0]["result"]["number"], json!("0x3"));
    }

    #[tokio::test]
    async fn null_id_ticks_malformed_and_stops_the_stream() {
        let (state, _, _) = state();
        let body = br#"{"id":null,"method":"eth_getWork","params":[]}
{"id":2,"method":"eth_getWork","params":[]}"#;
        let out = run_requests(&state, "9.9.9.9", LOGIN, None, body).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_minus_three() {
        let (state, _, _) = state();
        let body = br#"{"id":5,"method":"eth_mystery","params":[]}"#;
        let out = run_requests(&state, "1.2.3.4", LOGIN, None, body).await;
        let replies = parse_replies(&out);
        assert_eq!(replies[0]["error"]["code"], json!(-3));
    }

    #[test]
    fn route_login_shape() {
        assert!(is_route_login("0xAbC0000000000000000000000000000000000001"));
        assert!(is_route_login(LOGIN));
        assert!(!is_route_login("0x123"));
        assert!(!is_route_login("AbC0000000000000000000000000000000000001aa"));
    }

    #[test]
    fn forwarded_header_is_honoured_only_behind_proxy() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        assert_eq!(remote_ip(false, peer, &headers), "10.0.0.1");
        assert_eq!(remote_ip(true, peer, &headers), "203.0.113.9");

        let mut bogus = HeaderMap::new();
        bogus.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(remote_ip(true, peer, &bogus), "10.0.0.1");
    }
}
