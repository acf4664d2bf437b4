//! Transport and node client against a mock JSON-RPC node on localhost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use kquai_monitor::error::Error;
use kquai_monitor::fixed::Fixed;
use kquai_monitor::node::{ChainSource, NodeClient};
use kquai_monitor::poller::{self, PollController, PollState, WindowSettings};
use kquai_monitor::ratio::RatioEngine;
use kquai_monitor::rpc::{CallOptions, RetryPolicy, RpcClient, RpcRequest, Transport};
use kquai_monitor::units::{format_wei, parse_hex_u64, quote_decimals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    RpcError,
    Unavailable,
    Slow,
    ObjectForBatch,
}

#[derive(Clone)]
struct MockNode {
    mode: Mode,
    latest: u64,
    posts: Arc<AtomicUsize>,
}

fn error_item(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn answer(node: &MockNode, request: &Value) -> Value {
    let id = request["id"].clone();
    if node.mode == Mode::RpcError {
        return error_item(id, -32601, "method not found");
    }
    let block = request["params"][0].as_str().and_then(parse_hex_u64);
    let result = match request["method"].as_str().unwrap_or_default() {
        "quai_blockNumber" => json!(format!("{:#x}", node.latest)),
        "quai_getMinerDiffNormalized" if block == Some(102) => {
            return error_item(id, -32000, "difficulty unavailable");
        }
        "quai_getMinerDiffNormalized" => json!("0x100"),
        "quai_getBestDiffNormalized" => json!("0x200"),
        "quai_getHeaderByNumber" => json!({
            "number": request["params"][0],
            "exchangeRate": "0x3e8",
            "woHeader": {"timestamp": "0x6553f100"},
        }),
        "quai_qiToQuai" => json!("0x6f05b59d3b20000"),
        _ => return error_item(id, -32601, "method not found"),
    };
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn handle(State(node): State<MockNode>, Json(body): Json<Value>) -> Response {
    node.posts.fetch_add(1, Ordering::SeqCst);
    match node.mode {
        Mode::Unavailable => return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response(),
        Mode::Slow => tokio::time::sleep(Duration::from_secs(5)).await,
        Mode::ObjectForBatch if body.is_array() => {
            return Json(error_item(Value::Null, -32600, "batch not supported")).into_response();
        }
        _ => {}
    }
    match body {
        Value::Array(items) => {
            let answers: Vec<Value> = items.iter().map(|r| answer(&node, r)).collect();
            Json(Value::Array(answers)).into_response()
        }
        single => Json(answer(&node, &single)).into_response(),
    }
}

async fn spawn_node(mode: Mode) -> (String, Arc<AtomicUsize>) {
    let posts = Arc::new(AtomicUsize::new(0));
    let node = MockNode {
        mode,
        latest: 104,
        posts: posts.clone(),
    };
    let app = Router::new().route("/", post(handle)).with_state(node);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), posts)
}

fn client(url: &str) -> RpcClient {
    RpcClient::new(url, CallOptions::default())
}

#[tokio::test]
async fn test_single_call_success() {
    let (url, posts) = spawn_node(Mode::Normal).await;
    let rpc = client(&url);

    let value = rpc.call("quai_blockNumber", json!([])).await.unwrap();
    assert_eq!(value, json!("0x68"));

    let node = NodeClient::new(rpc, 2000);
    assert_eq!(node.latest_block_number().await.unwrap(), 104);
    assert_eq!(posts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rpc_error_member() {
    let (url, _) = spawn_node(Mode::RpcError).await;
    let err = client(&url)
        .call("quai_blockNumber", json!([]))
        .await
        .unwrap_err();
    match err {
        Error::Rpc { code, message } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "method not found");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_non_success_status_is_retried() {
    let (url, posts) = spawn_node(Mode::Unavailable).await;
    let options = CallOptions {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            backoff_multiplier: 2,
        },
        ..CallOptions::default()
    };
    let err = RpcClient::new(url, options)
        .call("quai_blockNumber", json!([]))
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::HttpStatus { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE)
    );
    assert!(err.is_transport());
    assert_eq!(posts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_deadline_cancels_call() {
    let (url, _) = spawn_node(Mode::Slow).await;
    let options = CallOptions {
        timeout: Duration::from_millis(200),
        batch_timeout: Duration::from_millis(200),
        ..CallOptions::default()
    };
    let rpc = RpcClient::new(url, options);

    let started = std::time::Instant::now();
    let err = rpc.call("quai_blockNumber", json!([])).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(4));

    let batch = [RpcRequest::new(1u64, "quai_blockNumber", json!([]))];
    assert!(matches!(
        rpc.call_batch(&batch).await,
        Err(Error::Timeout(_))
    ));
}

#[tokio::test]
async fn test_batch_response_must_be_array() {
    let (url, _) = spawn_node(Mode::ObjectForBatch).await;
    let batch = [RpcRequest::new(1u64, "quai_blockNumber", json!([]))];
    let err = client(&url).call_batch(&batch).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err}");
}

#[tokio::test]
async fn test_batch_items_fail_individually() {
    let (url, _) = spawn_node(Mode::Normal).await;
    let batch = [
        RpcRequest::new("102_m", "quai_getMinerDiffNormalized", json!(["0x66"])),
        RpcRequest::new("102_b", "quai_getBestDiffNormalized", json!(["0x66"])),
        RpcRequest::new("x", "quai_unknown", json!([])),
    ];
    let results = client(&url).call_batch(&batch).await.unwrap();

    assert_eq!(results.get(&"102_m".into()), None);
    assert!(results.answered(&"102_m".into()));
    assert_eq!(results.get_str(&"102_b".into()), Some("0x200"));
    assert_eq!(results.get(&"x".into()), None);
}

#[tokio::test]
async fn test_rebuild_over_http_with_split_posts() {
    let (url, posts) = spawn_node(Mode::Normal).await;
    // 15 requests at 4 per POST
    let node = NodeClient::new(client(&url), 4);

    let window = poller::rebuild(&node, 100, 104, 10, &RatioEngine::default())
        .await
        .unwrap();

    assert_eq!(posts.load(Ordering::SeqCst), 4);
    assert_eq!(window.len(), 5);
    for entry in window.entries() {
        if entry.block_number == 102 {
            assert_eq!(entry.ratio, Fixed::ONE);
            assert_eq!(entry.delta_k, Fixed::ZERO);
        } else {
            assert_eq!(entry.ratio.to_string(), "2");
        }
        assert_eq!(entry.exchange_rate_raw.as_deref(), Some("0x3e8"));
        assert_eq!(entry.timestamp(), Some(0x6553f100));
    }
}

#[tokio::test]
async fn test_controller_against_node() {
    let (url, _) = spawn_node(Mode::Normal).await;
    let node = NodeClient::new(client(&url), 2000);
    let mut controller = PollController::new(
        node,
        RatioEngine::default(),
        WindowSettings {
            size: 3,
            chunk_size: 2,
        },
    );

    assert_eq!(controller.refresh().await.unwrap(), 3);
    assert_eq!(controller.state(), &PollState::Idle);
    let report = controller.report().unwrap();
    assert_eq!(report.chunks.len(), 2);
    assert_eq!(report.latest.as_ref().map(|e| e.block_number), Some(104));
}

#[tokio::test]
async fn test_qi_to_quai_quote() {
    let (url, _) = spawn_node(Mode::Normal).await;
    let node = NodeClient::new(client(&url), 2000);
    let wei = node.qi_to_quai(1000).await.unwrap().unwrap();
    assert_eq!(format_wei(wei, quote_decimals(wei)), "0.5");
}
