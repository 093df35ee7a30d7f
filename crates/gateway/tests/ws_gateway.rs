//! End-to-end gateway tests: a real server on an ephemeral port, a real
//! WebSocket client, the in-process memory broker, and a scripted worker
//! pool standing in for the application backend.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gateway::{Gateway, GatewayConfig, Payload, PoolConfig, WorkerFactory, WorkerPool};
use pubsub::{memory::MemoryBroker, BrokerRegistry, Message, Publisher, Subscriber};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite, MaybeTlsStream, WebSocketStream,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Worker pool scripted from the request context it receives. Records
/// every serialized request together with the pool generation that
/// answered it.
#[derive(Default)]
struct ScriptedPool {
    deny_server_status: Option<u16>,
    deny_topics: Vec<String>,
    calls: Mutex<Vec<(usize, Value)>>,
    generation: AtomicUsize,
}

impl ScriptedPool {
    fn topic_calls(&self) -> Vec<(usize, Value)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ctx)| ctx["attributes"].get("ws:joinTopics").is_some())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkerPool for ScriptedPool {
    async fn exec(&self, mut payload: Payload) -> anyhow::Result<Payload> {
        let ctx: Value = serde_json::from_slice(&payload.context)?;
        let generation = self.generation.load(Ordering::SeqCst);
        self.calls.lock().unwrap().push((generation, ctx.clone()));

        let attributes = &ctx["attributes"];
        let status = if attributes.get("ws:joinServer").is_some() {
            self.deny_server_status.unwrap_or(200)
        } else if let Some(topics) = attributes["ws:joinTopics"].as_str() {
            if topics
                .split(',')
                .any(|t| self.deny_topics.iter().any(|d| d == t))
            {
                403
            } else {
                200
            }
        } else {
            200
        };

        payload.context.clear();
        payload.context.extend_from_slice(
            serde_json::to_vec(&serde_json::json!({
                "headers": {"X-Reason": ["scripted"]},
                "status": status,
            }))?
            .as_slice(),
        );
        payload.body.clear();
        if status != 200 {
            payload.body.extend_from_slice(b"denied");
        }
        Ok(payload)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn workers(&self) -> usize {
        1
    }
}

struct FixedFactory(Arc<ScriptedPool>);

#[async_trait]
impl WorkerFactory for FixedFactory {
    async fn new_pool(
        &self,
        _cfg: &PoolConfig,
        env: HashMap<String, String>,
    ) -> anyhow::Result<Arc<dyn WorkerPool>> {
        assert_eq!(env.get("RR_MODE").map(String::as_str), Some("http"));
        assert!(env.contains_key("RR_BROADCAST_PATH"));
        Ok(self.0.clone())
    }
}

struct TestGateway {
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    broker: Arc<MemoryBroker>,
    pool: Arc<ScriptedPool>,
}

async fn start(pool: ScriptedPool, allowed_origins: Vec<String>) -> TestGateway {
    let pool = Arc::new(pool);
    let broker = Arc::new(MemoryBroker::new());
    let mut brokers = BrokerRegistry::new();
    brokers.register("memory", broker.clone());

    let cfg = GatewayConfig {
        allowed_origins,
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(cfg, &brokers, Arc::new(FixedFactory(pool.clone())))
        .await
        .unwrap();
    let _fatal = gateway.serve();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gateway
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        addr,
        gateway,
        broker,
        pool,
    }
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send_json(client: &mut WsClient, json: &str) {
    client
        .send(tungstenite::Message::Text(json.into()))
        .await
        .unwrap();
}

async fn next_text(client: &mut WsClient) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        match frame {
            tungstenite::Message::Text(text) => return text.to_string(),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn broker_members(broker: &MemoryBroker, topic: &str) -> HashSet<uuid::Uuid> {
    let mut out = HashSet::new();
    broker.connections(topic, &mut out);
    out
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn join_confirms_and_delivers_broker_messages() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["topics"], serde_json::json!(["news"]));

    // broker registration and index mirror both reflect the join
    assert_eq!(broker_members(&tg.broker, "news").len(), 1);
    assert_eq!(tg.gateway.topic_index().members_of("news").len(), 1);

    tg.broker
        .publish(Message::new("news", "hello"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut client).await, "hello");

    // a message on an unrelated topic is not delivered
    tg.broker
        .publish(Message::new("other", "not-for-you"))
        .await
        .unwrap();
    tg.broker
        .publish(Message::new("news", "second"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut client).await, "second");
}

#[tokio::test]
async fn denied_join_leaves_no_state_behind() {
    let tg = start(
        ScriptedPool {
            deny_topics: vec!["secret".to_string()],
            ..ScriptedPool::default()
        },
        vec!["*".to_string()],
    )
    .await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["secret"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 403);
    assert_eq!(reply["topics"], serde_json::json!(["secret"]));

    assert!(broker_members(&tg.broker, "secret").is_empty());
    assert!(tg.gateway.topic_index().members_of("secret").is_empty());

    // the connection keeps running after a denial
    send_json(&mut client, r#"{"command":"join","topics":["open"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
}

#[tokio::test]
async fn leave_and_noop_leave() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;
    send_json(&mut client, r#"{"command":"leave","topics":["news"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["topics"], serde_json::json!([]));
    assert!(broker_members(&tg.broker, "news").is_empty());

    // leaving an unsubscribed topic is a no-op success
    send_json(&mut client, r#"{"command":"leave","topics":["ghost"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
}

#[tokio::test]
async fn disconnect_cleans_up_subscriptions() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;
    assert_eq!(tg.gateway.registry().count(), 1);

    drop(client);

    let gateway = tg.gateway.clone();
    let broker = tg.broker.clone();
    wait_until(move || {
        gateway.topic_index().members_of("news").is_empty()
            && broker_members(&broker, "news").is_empty()
            && gateway.registry().count() == 0
    })
    .await;
}

#[tokio::test]
async fn disallowed_origin_is_rejected_with_405() {
    let tg = start(
        ScriptedPool::default(),
        vec!["https://ok.example".to_string()],
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/ws", tg.addr))
        .header("Origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    // no server-admission call was made for the rejected request
    assert!(tg.pool.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn server_admission_denial_propagates_status_and_headers() {
    let tg = start(
        ScriptedPool {
            deny_server_status: Some(401),
            ..ScriptedPool::default()
        },
        vec!["*".to_string()],
    )
    .await;

    let err = connect_async(format!("ws://{}/ws", tg.addr))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
            assert_eq!(
                response
                    .headers()
                    .get("X-Reason")
                    .map(|v| v.to_str().unwrap()),
                Some("scripted")
            );
            assert_eq!(response.body().as_deref(), Some(b"denied".as_slice()));
        }
        other => panic!("expected HTTP denial, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_join_reissues_authorization() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;
    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["topics"], serde_json::json!(["news"]));

    assert_eq!(tg.pool.topic_calls().len(), 2);
    assert_eq!(tg.gateway.topic_index().members_of("news").len(), 1);
}

#[tokio::test]
async fn malformed_and_unknown_commands_get_error_frames() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, "not json at all").await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 400);

    send_json(&mut client, r#"{"command":"publish","topics":["x"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 400);

    // no mutation happened
    assert_eq!(tg.gateway.topic_index().topic_count(), 0);

    // the loop keeps running
    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
}

#[tokio::test]
async fn headers_command_feeds_later_authorization_calls() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(
        &mut client,
        r#"{"command":"headers","headers":{"X-Token":"tok-123"}}"#,
    )
    .await;
    next_text(&mut client).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;

    let calls = tg.pool.topic_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["headers"]["X-Token"][0], "tok-123");
}

#[tokio::test]
async fn reset_swaps_workers_without_dropping_connections() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;

    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;

    tg.gateway.reset().await.unwrap();
    assert_eq!(tg.pool.generation.load(Ordering::SeqCst), 1);

    // the existing subscription still delivers
    tg.broker
        .publish(Message::new("news", "still-here"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut client).await, "still-here");

    // a new join routes to the refreshed pool
    send_json(&mut client, r#"{"command":"join","topics":["sport"]}"#).await;
    let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["status"], 200);
    let calls = tg.pool.topic_calls();
    assert_eq!(calls.last().unwrap().0, 1);
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber_exactly_once() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut first = connect(tg.addr).await;
    let mut second = connect(tg.addr).await;

    send_json(&mut first, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut first).await;
    send_json(&mut second, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut second).await;

    tg.broker
        .publish(Message::new("news", "fan-out"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut first).await, "fan-out");
    assert_eq!(next_text(&mut second).await, "fan-out");

    // exactly once: the next frame each client sees is a fresh message
    tg.broker
        .publish(Message::new("news", "next"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut first).await, "next");
    assert_eq!(next_text(&mut second).await, "next");
}

#[tokio::test]
async fn status_endpoint_reports_counts() {
    let tg = start(ScriptedPool::default(), vec!["*".to_string()]).await;
    let mut client = connect(tg.addr).await;
    send_json(&mut client, r#"{"command":"join","topics":["news"]}"#).await;
    next_text(&mut client).await;

    let status: Value = reqwest::get(format!("http://{}/status", tg.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["connections"], 1);
    assert_eq!(status["topics"], 1);
    assert_eq!(status["subscribed_connections"], 1);
    assert_eq!(status["workers"], 1);
}
