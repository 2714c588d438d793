//! Publishing, consumed messages and listener supervision.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use switchyard_broker::{
    AckMode, Broker, BrokerEndpoint, Credentials, Headers, MemoryBroker, OutboundMessage,
    QueueSpec, TransportError,
};
use switchyard_rpc::{
    handler_fn, HandlerError, HandlerOutput, HandlerRegistry, ListenerSupervisor, Request,
    RpcError, SendOutcome,
};
use switchyard_topology::{DispatchStyle, MessageKind, QueueBinding, TopologyStore};
use tokio::sync::{mpsc, Semaphore};

use common::{eventually, fast_config, fixtures, TestBus};

/// Registry whose `AuditEvent` handler forwards payloads to the returned receiver.
fn auditing_registry() -> (HandlerRegistry, mpsc::UnboundedReceiver<Request>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = fixtures::llm_registry();
    registry.register(
        "AuditEvent",
        handler_fn(move |req: Request| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(req);
                Ok::<_, HandlerError>(HandlerOutput::ok(Value::Null))
            }
        }),
    );
    (registry, rx)
}

#[tokio::test]
async fn produced_message_reaches_consumer() {
    let (registry, mut audits) = auditing_registry();
    let bus = TestBus::with_registry(registry, fast_config()).await;

    let mut headers = Headers::new();
    headers.insert("Source".to_string(), "agent-7".to_string());
    bus.producer()
        .publish("AuditEvent", json!({"action": "login"}), headers)
        .await
        .unwrap();

    let request = tokio::time::timeout(Duration::from_secs(2), audits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.code, "AuditEvent");
    assert_eq!(request.payload, json!({"action": "login"}));
    assert_eq!(request.headers.get("Source").map(String::as_str), Some("agent-7"));
    assert!(!request.redelivered);
    bus.stop().await;
}

#[tokio::test]
async fn producer_gives_up_after_max_attempts() {
    let bus = TestBus::start().await;
    bus.broker.reject_connections(true);

    let started = tokio::time::Instant::now();
    let err = bus
        .producer()
        .publish("AuditEvent", json!({}), Headers::new())
        .await
        .unwrap_err();

    match err {
        RpcError::DeliveryFailed {
            code,
            attempts,
            source,
        } => {
            assert_eq!(code, "AuditEvent");
            assert_eq!(attempts, 3);
            assert!(matches!(source, TransportError::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Two waits between three attempts.
    assert!(started.elapsed() >= Duration::from_millis(40));

    bus.broker.reject_connections(false);
    bus.stop().await;
}

#[tokio::test]
async fn producer_does_not_retry_broker_rejections() {
    let mut config = fast_config();
    config.producer.retry_interval = Duration::from_secs(1);
    let bus = TestBus::with_config(config).await;

    let mut route = bus.agent().client("AuditEvent").unwrap();
    route.exchange = "NoSuchExchange".to_string();

    let started = tokio::time::Instant::now();
    let err = bus
        .producer()
        .publish_route(&route, json!({}), Headers::new())
        .await
        .unwrap_err();

    match err {
        RpcError::DeliveryFailed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 1);
            assert!(matches!(source, TransportError::Protocol(_)));
            assert!(!source.is_retryable());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    bus.stop().await;
}

#[tokio::test]
async fn producer_recovers_when_broker_returns() {
    let (registry, mut audits) = auditing_registry();
    let mut config = fast_config();
    config.producer.max_attempts = 10;
    config.producer.retry_interval = Duration::from_millis(50);
    let bus = TestBus::with_registry(registry, config).await;

    bus.broker.reject_connections(true);
    let broker = bus.broker.clone();
    let heal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        broker.reject_connections(false);
    });

    bus.producer()
        .publish("AuditEvent", json!({"n": 1}), Headers::new())
        .await
        .unwrap();
    heal.await.unwrap();

    let request = tokio::time::timeout(Duration::from_secs(2), audits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.payload, json!({"n": 1}));
    bus.stop().await;
}

#[tokio::test]
async fn messenger_calls_or_publishes_by_declaration() {
    let (registry, mut audits) = auditing_registry();
    let bus = TestBus::with_registry(registry, fast_config()).await;
    let messenger = bus.messenger();

    match messenger.send("Ping", json!({}), Headers::new()).await.unwrap() {
        SendOutcome::Replied(response) => assert_eq!(response.body, json!({"pong": true})),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let outcome = messenger
        .send("AuditEvent", json!({"via": "messenger"}), Headers::new())
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Published);
    let request = tokio::time::timeout(Duration::from_secs(2), audits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.payload, json!({"via": "messenger"}));

    let err = messenger
        .send("Unknown", json!({}), Headers::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Topology(_)));
    bus.stop().await;
}

#[tokio::test]
async fn listeners_restart_after_connection_loss() {
    let bus = TestBus::start().await;
    let client = bus.client();
    client
        .call("Ping", json!({}), Headers::new(), Duration::from_secs(2))
        .await
        .unwrap();

    let severed = bus.broker.sever_connections();
    assert_eq!(severed, fixtures::LLM_QUEUES + 1);
    assert_eq!(bus.broker.consumer_count("/", "llm.ping"), Some(0));

    let queues = [
        "llm.ping",
        "llm.chat",
        "llm.fail",
        "llm.panic",
        "llm.unregistered",
        "llm.router",
        "llm.audit",
    ];
    assert!(
        eventually(Duration::from_secs(2), || {
            queues
                .iter()
                .all(|q| bus.broker.consumer_count("/", q) == Some(1))
                && bus.supervisor.ready_count() == fixtures::LLM_QUEUES
        })
        .await,
        "listeners did not come back"
    );

    // The pooled connection was closed too; the pool reconnects.
    let response = client
        .call("Ping", json!({}), Headers::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"pong": true}));
    bus.stop().await;
}

#[tokio::test]
async fn unacked_message_is_redelivered_to_listener() {
    let broker = MemoryBroker::new();
    let backend: Arc<dyn Broker> = Arc::new(broker.clone());

    // A consumer that takes the message and goes away without acking it.
    let conn = backend
        .connect(&BrokerEndpoint::default(), &Credentials::guest())
        .await
        .unwrap();
    let channel = conn.open_channel().await.unwrap();
    channel
        .declare_queue(&QueueSpec::durable("llm.audit"))
        .await
        .unwrap();
    channel
        .publish("", "llm.audit", OutboundMessage::new(br#"{"n": 1}"#.to_vec()))
        .await
        .unwrap();
    let mut stream = channel
        .consume("llm.audit", AckMode::AfterProcessing)
        .await
        .unwrap();
    let taken = stream.next().await.unwrap().unwrap();
    assert!(!taken.redelivered);
    drop(stream);
    drop(channel);
    drop(conn);
    assert_eq!(broker.queue_depth("/", "llm.audit"), Some(1));

    let (registry, mut audits) = auditing_registry();
    let mut supervisor =
        ListenerSupervisor::new(Arc::clone(&backend), Arc::new(registry), &fast_config());
    assert_eq!(supervisor.launch_bindings(vec![audit_binding()]), 1);

    let request = tokio::time::timeout(Duration::from_secs(2), audits.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(request.redelivered);
    assert_eq!(request.payload, json!({"n": 1}));

    supervisor.shutdown();
    supervisor.wait().await;
    assert_eq!(broker.queue_depth("/", "llm.audit"), Some(0));
}

#[tokio::test]
async fn on_delivery_listeners_do_not_redeliver_in_flight_messages() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let registry = fixtures::llm_registry();
    let gate = Arc::clone(&release);
    registry.register(
        "AuditEvent",
        handler_fn(move |req: Request| {
            let started_tx = started_tx.clone();
            let gate = Arc::clone(&gate);
            async move {
                let _ = started_tx.send(req);
                let _ = gate.acquire().await;
                Ok::<_, HandlerError>(HandlerOutput::ok(Value::Null))
            }
        }),
    );

    let mut config = fast_config();
    config.server.ack_mode = AckMode::OnDelivery;
    let bus = TestBus::with_registry(registry, config).await;

    let response = bus
        .client()
        .call("Ping", json!({}), Headers::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"pong": true}));

    bus.producer()
        .publish("AuditEvent", json!({"n": 1}), Headers::new())
        .await
        .unwrap();
    let request: Request = tokio::time::timeout(Duration::from_secs(2), started.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!request.redelivered);
    // Settled on delivery: nothing is left on the queue while the handler runs.
    assert_eq!(bus.broker.queue_depth("/", "llm.audit"), Some(0));

    bus.broker.sever_connections();
    release.add_permits(1);

    assert!(
        eventually(Duration::from_secs(2), || {
            bus.broker.consumer_count("/", "llm.audit") == Some(1)
                && bus.supervisor.ready_count() == fixtures::LLM_QUEUES
        })
        .await,
        "listeners did not come back"
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), started.recv())
            .await
            .is_err(),
        "in-flight message was delivered again"
    );
    assert_eq!(bus.broker.queue_depth("/", "llm.audit"), Some(0));
    bus.stop().await;
}

fn audit_binding() -> QueueBinding {
    QueueBinding {
        queue: "llm.audit".to_string(),
        code: "AuditEvent".to_string(),
        kind: MessageKind::Consumed,
        exchange: String::new(),
        routing_key: "AuditEvent".to_string(),
        endpoint: BrokerEndpoint::default(),
        credentials: Credentials::guest(),
        dispatch: DispatchStyle::Queue,
    }
}

#[tokio::test]
async fn failing_listener_does_not_affect_others() {
    let bus = TestBus::start().await;

    // Another connection holds an exclusive queue, so a loop for it can
    // never start.
    let holder = bus
        .broker
        .connect(&BrokerEndpoint::default(), &Credentials::guest())
        .await
        .unwrap();
    let holder_channel = holder.open_channel().await.unwrap();
    let mut spec = QueueSpec::durable("locked.queue");
    spec.exclusive = true;
    holder_channel.declare_queue(&spec).await.unwrap();

    let mut config = fast_config();
    config.supervisor.max_restarts = 2;
    let registry = Arc::new(fixtures::llm_registry());
    let backend: Arc<dyn Broker> = Arc::new(bus.broker.clone());
    let mut supervisor = ListenerSupervisor::new(backend, registry, &config);
    let mut locked = audit_binding();
    locked.queue = "locked.queue".to_string();
    supervisor.launch_bindings(vec![locked]);

    assert!(!supervisor.wait_ready(Duration::from_millis(200)).await);
    assert_eq!(supervisor.ready_count(), 0);

    // Abandoned after its restarts; waiting returns on its own.
    tokio::time::timeout(Duration::from_secs(2), supervisor.wait())
        .await
        .unwrap();

    let response = bus
        .client()
        .call("Ping", json!({}), Headers::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"pong": true}));
    drop(holder_channel);
    bus.stop().await;
}

#[tokio::test]
async fn run_until_stops_listeners_on_shutdown() {
    let broker = MemoryBroker::new();
    let backend: Arc<dyn Broker> = Arc::new(broker.clone());
    let store = TopologyStore::parse(fixtures::TOPOLOGY).unwrap();
    let mut supervisor = ListenerSupervisor::new(
        backend,
        Arc::new(fixtures::llm_registry()),
        &fast_config(),
    );
    supervisor.launch(&store.load("LLM").unwrap());
    assert!(supervisor.wait_ready(Duration::from_secs(2)).await);
    assert_eq!(broker.connection_count(), fixtures::LLM_QUEUES);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(supervisor.run_until(async move {
        let _ = stop_rx.await;
    }));
    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.consumer_count("/", "llm.ping"), Some(0));
    // Durable queues outlive their consumers.
    assert!(broker.queue_exists("/", "llm.ping"));
}
