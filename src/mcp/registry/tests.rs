use super::*;
use crate::mcp::error::NegotiationError;
use crate::mcp::negotiator::tests::{FakeFactory, FakeTransport};
use crate::mcp::negotiator::LiveTransport;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

fn two_tools(transport: &FakeTransport) {
    transport.respond(
        "tools/list",
        json!({"tools": [
            {"name": "echo", "inputSchema": {"type": "object"}},
            {"name": "reverse", "inputSchema": {"type": "object"}}
        ]}),
    );
}

fn registry_with(factory: Arc<FakeFactory>) -> ConnectionRegistry {
    ConnectionRegistry::new(Arc::new(TransportNegotiator::new(factory)))
}

fn echo_tool() -> EndpointDescriptor {
    EndpointDescriptor::process("t1", "echo-tool", Vec::new())
}

#[tokio::test]
async fn connect_then_disconnect_process_endpoint() {
    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(two_tools));
    let registry = registry_with(factory.clone());

    let outcome = registry.connect(echo_tool()).await;
    let ConnectionOutcome::Connected(connection) = outcome else {
        panic!("expected connected outcome, got {outcome:?}");
    };
    assert_eq!(connection.catalog.tools.len(), 2);
    assert_eq!(connection.transport_used, TransportKind::Process);
    assert_eq!(registry.list_ids().await, vec!["t1".to_string()]);
    assert!(registry.is_connected("t1").await);

    registry.disconnect("t1").await;
    assert!(registry.list_ids().await.is_empty());
    let opened = factory.last_opened().expect("transport opened");
    assert!(opened.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let registry = registry_with(factory);
    registry.connect(echo_tool()).await;

    registry.disconnect("t1").await;
    registry.disconnect("t1").await;
    registry.disconnect("never-connected").await;
    assert!(registry.list_ids().await.is_empty());
}

/// Connector that records whether an earlier transport was still open when a
/// new negotiation started.
struct TeardownCheckingConnector {
    factory: Arc<FakeFactory>,
    inner: TransportNegotiator,
    saw_open_transport: AtomicBool,
}

#[async_trait]
impl TransportConnector for TeardownCheckingConnector {
    async fn connect(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<LiveTransport, NegotiationError> {
        let opened = self.factory.opened.lock().map(|o| o.clone()).unwrap_or_default();
        if opened.iter().any(|t| !t.closed.load(Ordering::SeqCst)) {
            self.saw_open_transport.store(true, Ordering::SeqCst);
        }
        self.inner.negotiate(descriptor).await
    }
}

#[tokio::test]
async fn reconnect_tears_down_previous_transport_first() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let connector = Arc::new(TeardownCheckingConnector {
        factory: factory.clone(),
        inner: TransportNegotiator::new(factory.clone()),
        saw_open_transport: AtomicBool::new(false),
    });
    let registry = ConnectionRegistry::new(connector.clone());

    assert!(registry.connect(echo_tool()).await.is_connected());
    assert!(registry.connect(echo_tool()).await.is_connected());

    assert!(!connector.saw_open_transport.load(Ordering::SeqCst));
    assert_eq!(registry.list_ids().await.len(), 1);
    let opened = factory.opened.lock().expect("lock").clone();
    assert_eq!(opened.len(), 2);
    assert!(opened[0].closed.load(Ordering::SeqCst));
    assert!(!opened[1].closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn negotiation_failure_is_a_failed_outcome() {
    let factory = Arc::new(FakeFactory::new(vec![TransportKind::Process]));
    let registry = registry_with(factory);

    let outcome = registry.connect(echo_tool()).await;
    assert!(matches!(outcome, ConnectionOutcome::Failed { ref id, .. } if id == "t1"));
    assert!(registry.list_ids().await.is_empty());
}

#[tokio::test]
async fn closed_session_probe_gets_clear_message() {
    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(|transport| {
        transport.fail("tools/list", "MCP error -32000: Connection closed");
    }));
    let registry = registry_with(factory.clone());

    let outcome = registry.connect(echo_tool()).await;
    let ConnectionOutcome::Failed { message, .. } = outcome else {
        panic!("probe failure must not connect");
    };
    assert!(message.contains("closed immediately"));
    assert!(registry.list_ids().await.is_empty());
    let opened = factory.last_opened().expect("transport opened");
    assert!(opened.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unauthorized_event_stream_gets_transport_hint() {
    let factory = Arc::new(FakeFactory::new(vec![TransportKind::EventStream]));
    let registry = registry_with(factory);

    let outcome = registry
        .connect(EndpointDescriptor::event_stream("events", "https://example.com/sse"))
        .await;
    // The fake reports "<kind> unavailable"; no 401 means the generic message.
    assert!(matches!(outcome, ConnectionOutcome::Failed { ref message, .. } if message.contains("unavailable")));

    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(|transport| {
        transport.fail("initialize", "HTTP error: 401 Unauthorized");
    }));
    let registry = registry_with(factory);
    let outcome = registry
        .connect(EndpointDescriptor::event_stream("events", "https://example.com/sse"))
        .await;
    assert!(matches!(outcome, ConnectionOutcome::Failed { ref message, .. } if message.contains("embed the credential")));
}

#[tokio::test]
async fn partial_catalog_failure_still_connects() {
    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(|transport| {
        two_tools(transport);
        transport.fail("prompts/list", "prompts exploded");
        transport.respond(
            "resources/list",
            json!({"resources": [{"uri": "file:///notes", "name": "notes"}]}),
        );
    }));
    let registry = registry_with(factory);

    let outcome = registry.connect(echo_tool()).await;
    let ConnectionOutcome::Connected(connection) = outcome else {
        panic!("partial failure should still connect");
    };
    assert_eq!(connection.catalog.tools.len(), 2);
    assert!(connection.catalog.prompts.is_empty());
    assert_eq!(connection.catalog.resources.len(), 1);
}

#[tokio::test]
async fn total_catalog_failure_is_not_inserted() {
    // The probe's own tool listing succeeds; every catalog listing after it fails.
    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(|transport| {
        transport.fail_after("tools/list", 1, "down");
        transport.fail("prompts/list", "down");
        transport.fail("resources/list", "down");
    }));
    let registry = registry_with(factory.clone());

    let outcome = registry.connect(echo_tool()).await;
    assert!(matches!(outcome, ConnectionOutcome::Failed { .. }));
    assert!(registry.list_ids().await.is_empty());
    let opened = factory.last_opened().expect("transport opened");
    assert!(opened.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn validate_evicts_dead_connections() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let registry = registry_with(factory.clone());
    registry.connect(echo_tool()).await;
    registry
        .connect(EndpointDescriptor::process("t2", "other-tool", Vec::new()))
        .await;

    assert!(registry.validate("t1").await);
    let opened = factory.opened.lock().expect("lock").clone();
    opened[0].fail("tools/list", "MCP error -32000: Connection closed");

    assert_eq!(registry.validate_all().await, vec!["t2".to_string()]);
    assert!(!registry.is_connected("t1").await);
    assert!(opened[0].closed.load(Ordering::SeqCst));
    assert!(!registry.validate("unknown").await);
}

#[tokio::test]
async fn refresh_replaces_catalog_wholesale() {
    let factory = Arc::new(FakeFactory::new(Vec::new()).with_setup(two_tools));
    let registry = registry_with(factory.clone());
    registry.connect(echo_tool()).await;

    let transport = factory.last_opened().expect("opened");
    transport.respond(
        "tools/list",
        json!({"tools": [{"name": "only", "inputSchema": {"type": "object"}}]}),
    );
    let refreshed = registry.refresh_catalog("t1").await.expect("refresh");
    assert_eq!(refreshed.catalog.tools.len(), 1);
    assert_eq!(refreshed.catalog.tools[0].name, "only");

    transport.fail("tools/list", "down");
    transport.fail("prompts/list", "down");
    transport.fail("resources/list", "down");
    let err = registry.refresh_catalog("t1").await.expect_err("total failure");
    assert!(matches!(err, RefreshError::Unavailable { .. }));
    assert!(!registry.is_connected("t1").await);

    assert!(matches!(
        registry.refresh_catalog("t1").await,
        Err(RefreshError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn disconnect_all_closes_everything() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let registry = registry_with(factory.clone());
    registry.connect(echo_tool()).await;
    registry
        .connect(EndpointDescriptor::http("remote", "https://example.com/mcp"))
        .await;
    assert_eq!(registry.list_ids().await.len(), 2);

    registry.disconnect_all().await;
    assert!(registry.list_ids().await.is_empty());
    let opened = factory.opened.lock().expect("lock").clone();
    assert!(opened.iter().all(|t| t.closed.load(Ordering::SeqCst)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_for_one_id_leave_one_open_transport() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let registry = Arc::new(registry_with(factory.clone()));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.connect(echo_tool()).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.expect("join").is_connected());
    }

    assert_eq!(registry.list_ids().await, vec!["t1".to_string()]);
    let opened = factory.opened.lock().expect("lock").clone();
    assert_eq!(opened.len(), 32);
    let open: Vec<_> = opened
        .iter()
        .filter(|t| !t.closed.load(Ordering::SeqCst))
        .collect();
    assert_eq!(open.len(), 1);

    let current = registry.get("t1").await.expect("connected");
    assert_eq!(
        Arc::as_ptr(&current.transport) as *const (),
        Arc::as_ptr(open[0]) as *const ()
    );
    assert!(registry.id_locks.lock().await.is_empty());
}

/// Connector that parks negotiation for one id until released.
struct GatedConnector {
    inner: TransportNegotiator,
    gated_id: &'static str,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl TransportConnector for GatedConnector {
    async fn connect(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<LiveTransport, NegotiationError> {
        if descriptor.id == self.gated_id {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.negotiate(descriptor).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_connect_does_not_block_other_ids() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let connector = Arc::new(GatedConnector {
        inner: TransportNegotiator::new(factory),
        gated_id: "slow",
        started: Notify::new(),
        release: Notify::new(),
    });
    let registry = Arc::new(ConnectionRegistry::new(connector.clone()));

    let slow = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .connect(EndpointDescriptor::process("slow", "slow-tool", Vec::new()))
                .await
        })
    };
    connector.started.notified().await;

    let fast = tokio::time::timeout(Duration::from_secs(5), registry.connect(echo_tool()))
        .await
        .expect("t1 connects while slow is still negotiating");
    assert!(fast.is_connected());
    assert!(!slow.is_finished());
    assert_eq!(registry.list_ids().await, vec!["t1".to_string()]);

    connector.release.notify_one();
    assert!(slow.await.expect("join").is_connected());
    assert_eq!(
        registry.list_ids().await,
        vec!["slow".to_string(), "t1".to_string()]
    );
}

#[tokio::test]
async fn id_locks_are_released_after_use() {
    let factory = Arc::new(FakeFactory::new(Vec::new()));
    let registry = registry_with(factory);

    registry.connect(echo_tool()).await;
    registry.refresh_catalog("t1").await.expect("refresh");
    registry.disconnect("t1").await;
    registry.disconnect("never-connected").await;
    let _ = registry.refresh_catalog("never-connected").await;

    assert!(registry.id_locks.lock().await.is_empty());
}
