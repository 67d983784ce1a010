//! Turns an endpoint descriptor into a live, initialized transport.
//!
//! `http` endpoints try streamable HTTP first and fall back to the legacy
//! event-stream transport exactly once.

use super::descriptor::{EndpointDescriptor, TransportConfig, TransportKind};
use super::error::NegotiationError;
use super::protocol::{initialize, ServerInfo};
use super::transport::event_stream::EventStreamTransport;
use super::transport::stdio::StdioTransport;
use super::transport::streamable_http::StreamableHttpTransport;
use super::transport::{McpTransport, TransportTimeouts};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An established channel plus what the server said about itself.
#[derive(Clone)]
pub struct LiveTransport {
    pub transport: Arc<dyn McpTransport>,
    pub server_info: ServerInfo,
    /// The transport actually in use; differs from the descriptor's kind
    /// after a fallback.
    pub used: TransportKind,
}

/// Opens raw transports of a given kind for a descriptor.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        descriptor: &EndpointDescriptor,
        kind: TransportKind,
    ) -> Result<Arc<dyn McpTransport>, String>;
}

/// Produces live transports for the connection registry.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, descriptor: &EndpointDescriptor)
        -> Result<LiveTransport, NegotiationError>;
}

/// Factory that opens real processes and network connections.
pub struct WireTransportFactory {
    timeouts: TransportTimeouts,
}

impl WireTransportFactory {
    pub fn new(timeouts: TransportTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl TransportFactory for WireTransportFactory {
    async fn open(
        &self,
        descriptor: &EndpointDescriptor,
        kind: TransportKind,
    ) -> Result<Arc<dyn McpTransport>, String> {
        match (&descriptor.transport, kind) {
            (TransportConfig::Process { command, args, env }, TransportKind::Process) => {
                let transport =
                    StdioTransport::spawn(&descriptor.id, command, args, env, self.timeouts)?;
                Ok(Arc::new(transport))
            }
            (
                TransportConfig::Http { url, .. } | TransportConfig::EventStream { url, .. },
                TransportKind::EventStream,
            ) => {
                let transport =
                    EventStreamTransport::connect(&descriptor.id, url, self.timeouts).await?;
                Ok(Arc::new(transport))
            }
            (TransportConfig::Http { url, headers }, TransportKind::Http) => {
                let transport =
                    StreamableHttpTransport::new(&descriptor.id, url, headers, self.timeouts)?;
                Ok(Arc::new(transport))
            }
            (_, kind) => Err(format!(
                "Endpoint `{}` cannot be opened with the {kind} transport.",
                descriptor.id
            )),
        }
    }
}

pub struct TransportNegotiator {
    factory: Arc<dyn TransportFactory>,
}

impl TransportNegotiator {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self { factory }
    }

    pub fn with_timeouts(timeouts: TransportTimeouts) -> Self {
        Self::new(Arc::new(WireTransportFactory::new(timeouts)))
    }

    pub async fn negotiate(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<LiveTransport, NegotiationError> {
        descriptor
            .validate()
            .map_err(NegotiationError::InvalidDescriptor)?;

        match &descriptor.transport {
            TransportConfig::Process { command, .. } => {
                let transport = self
                    .factory
                    .open(descriptor, TransportKind::Process)
                    .await
                    .map_err(|message| NegotiationError::Spawn {
                        command: command.clone(),
                        message,
                    })?;
                self.handshake(transport, TransportKind::Process)
                    .await
                    .map_err(|message| NegotiationError::Handshake {
                        kind: TransportKind::Process,
                        message,
                    })
            }
            TransportConfig::EventStream { .. } => {
                if descriptor.has_headers() {
                    warn!(
                        server_id = %descriptor.id,
                        "Custom headers are not supported by the eventstream transport and will be ignored"
                    );
                }
                self.open_and_initialize(descriptor, TransportKind::EventStream)
                    .await
                    .map_err(|message| NegotiationError::Handshake {
                        kind: TransportKind::EventStream,
                        message,
                    })
            }
            TransportConfig::Http { .. } => {
                let primary = match self.open_and_initialize(descriptor, TransportKind::Http).await
                {
                    Ok(live) => return Ok(live),
                    Err(err) => err,
                };
                info!(
                    server_id = %descriptor.id,
                    error = %primary,
                    "Streamable HTTP failed; falling back to eventstream"
                );
                if descriptor.has_headers() {
                    warn!(
                        server_id = %descriptor.id,
                        "Custom headers will not be sent over the eventstream fallback"
                    );
                }
                self.open_and_initialize(descriptor, TransportKind::EventStream)
                    .await
                    .map_err(|fallback| NegotiationError::FallbackFailed { primary, fallback })
            }
        }
    }

    async fn open_and_initialize(
        &self,
        descriptor: &EndpointDescriptor,
        kind: TransportKind,
    ) -> Result<LiveTransport, String> {
        let transport = self.factory.open(descriptor, kind).await?;
        self.handshake(transport, kind).await
    }

    async fn handshake(
        &self,
        transport: Arc<dyn McpTransport>,
        kind: TransportKind,
    ) -> Result<LiveTransport, String> {
        match initialize(transport.as_ref()).await {
            Ok(server_info) => {
                debug!(kind = %kind, server = %server_info.name, "MCP handshake complete");
                Ok(LiveTransport {
                    transport,
                    server_info,
                    used: kind,
                })
            }
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    debug!(kind = %kind, error = %close_err, "Ignoring close failure after handshake error");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl TransportConnector for TransportNegotiator {
    async fn connect(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<LiveTransport, NegotiationError> {
        self.negotiate(descriptor).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp::transport::MCP_METHOD_NOT_FOUND;
    use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
    use rust_mcp_schema::RequestId;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted in-memory server used across the crate's tests.
    pub(crate) struct FakeTransport {
        kind: TransportKind,
        results: Mutex<HashMap<String, Result<Value, String>>>,
        fail_after: Mutex<HashMap<String, (usize, String)>>,
        pub(crate) closed: AtomicBool,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub(crate) fn new(kind: TransportKind) -> Self {
            let transport = Self {
                kind,
                results: Mutex::new(HashMap::new()),
                fail_after: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            };
            transport.respond(
                "initialize",
                json!({
                    "capabilities": {"tools": {}},
                    "protocolVersion": "2025-06-18",
                    "serverInfo": {"name": "fake", "version": "1.0.0"}
                }),
            );
            transport.respond("ping", json!({}));
            transport.respond("tools/list", json!({"tools": []}));
            transport.respond("prompts/list", json!({"prompts": []}));
            transport.respond("resources/list", json!({"resources": []}));
            transport
        }

        pub(crate) fn respond(&self, method: &str, result: Value) {
            if let Ok(mut results) = self.results.lock() {
                results.insert(method.to_string(), Ok(result));
            }
        }

        pub(crate) fn fail(&self, method: &str, error: &str) {
            if let Ok(mut results) = self.results.lock() {
                results.insert(method.to_string(), Err(error.to_string()));
            }
        }

        /// Answers normally `successes` times, then fails with `error`.
        pub(crate) fn fail_after(&self, method: &str, successes: usize, error: &str) {
            if let Ok(mut fail_after) = self.fail_after.lock() {
                fail_after.insert(method.to_string(), (successes, error.to_string()));
            }
        }

        /// Forgets the scripted answer so the method reports method-not-found.
        pub(crate) fn clear(&self, method: &str) {
            if let Ok(mut results) = self.results.lock() {
                results.remove(method);
            }
        }

        pub(crate) fn calls_to(&self, method: &str) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.iter().filter(|call| call.as_str() == method).count())
                .unwrap_or(0)
        }
    }

    fn method_of(request: RequestFromClient) -> String {
        crate::mcp::transport::request_message(request, RequestId::Integer(0))
            .ok()
            .and_then(|message| serde_json::to_value(message).ok())
            .and_then(|value| value.get("method").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
            if self.closed.load(Ordering::SeqCst) {
                return Err("MCP error -32000: Connection closed".to_string());
            }
            let method = method_of(request);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(method.clone());
            }
            let exhausted = self.fail_after.lock().ok().and_then(|mut fail_after| {
                let (remaining, error) = fail_after.get_mut(&method)?;
                if *remaining == 0 {
                    Some(error.clone())
                } else {
                    *remaining -= 1;
                    None
                }
            });
            if let Some(error) = exhausted {
                return Err(error);
            }
            let scripted = self
                .results
                .lock()
                .ok()
                .and_then(|results| results.get(&method).cloned());
            let body = match scripted {
                Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": 1, "result": result}),
                Some(Err(message)) => return Err(message),
                None => json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": MCP_METHOD_NOT_FOUND, "message": "Method not found"}
                }),
            };
            serde_json::from_value(body).map_err(|err| err.to_string())
        }

        async fn send_notification(
            &self,
            _notification: NotificationFromClient,
        ) -> Result<(), String> {
            Ok(())
        }

        async fn close(&self) -> Result<(), String> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Factory that fails for the listed kinds and counts every attempt.
    pub(crate) struct FakeFactory {
        failing: Vec<TransportKind>,
        pub(crate) attempts: Mutex<Vec<TransportKind>>,
        pub(crate) opened: Mutex<Vec<Arc<FakeTransport>>>,
        pub(crate) setup: Box<dyn Fn(&FakeTransport) + Send + Sync>,
        pub(crate) count: AtomicUsize,
    }

    impl FakeFactory {
        pub(crate) fn new(failing: Vec<TransportKind>) -> Self {
            Self {
                failing,
                attempts: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                setup: Box::new(|_| {}),
                count: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_setup(mut self, setup: impl Fn(&FakeTransport) + Send + Sync + 'static) -> Self {
            self.setup = Box::new(setup);
            self
        }

        pub(crate) fn attempts(&self) -> Vec<TransportKind> {
            self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
        }

        pub(crate) fn last_opened(&self) -> Option<Arc<FakeTransport>> {
            self.opened.lock().ok().and_then(|opened| opened.last().cloned())
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn open(
            &self,
            _descriptor: &EndpointDescriptor,
            kind: TransportKind,
        ) -> Result<Arc<dyn McpTransport>, String> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push(kind);
            }
            if self.failing.contains(&kind) {
                return Err(format!("{kind} unavailable"));
            }
            let transport = Arc::new(FakeTransport::new(kind));
            (self.setup)(&transport);
            if let Ok(mut opened) = self.opened.lock() {
                opened.push(transport.clone());
            }
            Ok(transport)
        }
    }

    #[tokio::test]
    async fn http_uses_streamable_transport_when_it_works() {
        let factory = Arc::new(FakeFactory::new(Vec::new()));
        let negotiator = TransportNegotiator::new(factory.clone());
        let live = negotiator
            .negotiate(&EndpointDescriptor::http("remote", "https://example.com/mcp"))
            .await
            .expect("negotiation succeeds");

        assert_eq!(live.used, TransportKind::Http);
        assert_eq!(live.server_info.name, "fake");
        assert_eq!(factory.attempts(), vec![TransportKind::Http]);
    }

    #[tokio::test]
    async fn http_falls_back_to_event_stream_once() {
        let factory = Arc::new(FakeFactory::new(vec![TransportKind::Http]));
        let negotiator = TransportNegotiator::new(factory.clone());
        let live = negotiator
            .negotiate(&EndpointDescriptor::http("remote", "https://example.com/mcp"))
            .await
            .expect("fallback succeeds");

        assert_eq!(live.used, TransportKind::EventStream);
        assert_eq!(
            factory.attempts(),
            vec![TransportKind::Http, TransportKind::EventStream]
        );
    }

    #[tokio::test]
    async fn fallback_is_attempted_at_most_once() {
        let factory = Arc::new(FakeFactory::new(vec![
            TransportKind::Http,
            TransportKind::EventStream,
        ]));
        let negotiator = TransportNegotiator::new(factory.clone());
        let err = match negotiator
            .negotiate(&EndpointDescriptor::http("remote", "https://example.com/mcp"))
            .await
        {
            Ok(_) => panic!("both transports fail"),
            Err(err) => err,
        };

        assert!(matches!(err, NegotiationError::FallbackFailed { .. }));
        assert_eq!(factory.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_handshake_closes_primary_before_fallback() {
        let factory = Arc::new(
            FakeFactory::new(Vec::new()).with_setup(|transport| {
                if transport.kind() == TransportKind::Http {
                    transport.fail("initialize", "HTTP error: 404 Not Found");
                }
            }),
        );
        let negotiator = TransportNegotiator::new(factory.clone());
        let live = negotiator
            .negotiate(&EndpointDescriptor::http("remote", "https://example.com/mcp"))
            .await
            .expect("fallback succeeds");

        assert_eq!(live.used, TransportKind::EventStream);
        let opened = factory.opened.lock().expect("lock").clone();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].closed.load(Ordering::SeqCst));
        assert!(!opened[1].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal_for_process_endpoints() {
        let factory = Arc::new(FakeFactory::new(vec![TransportKind::Process]));
        let negotiator = TransportNegotiator::new(factory.clone());
        let err = match negotiator
            .negotiate(&EndpointDescriptor::process("t1", "missing-tool", Vec::new()))
            .await
        {
            Ok(_) => panic!("spawn fails"),
            Err(err) => err,
        };

        assert!(matches!(err, NegotiationError::Spawn { ref command, .. } if command == "missing-tool"));
        assert_eq!(factory.attempts(), vec![TransportKind::Process]);
    }

    #[tokio::test]
    async fn event_stream_endpoints_never_try_streamable_http() {
        let factory = Arc::new(FakeFactory::new(vec![TransportKind::EventStream]));
        let negotiator = TransportNegotiator::new(factory.clone());
        let result = negotiator
            .negotiate(&EndpointDescriptor::event_stream("events", "https://example.com/sse"))
            .await;

        assert!(matches!(
            result,
            Err(NegotiationError::Handshake { kind: TransportKind::EventStream, .. })
        ));
        assert_eq!(factory.attempts(), vec![TransportKind::EventStream]);
    }

    #[tokio::test]
    async fn invalid_descriptor_is_rejected_before_opening() {
        let factory = Arc::new(FakeFactory::new(Vec::new()));
        let negotiator = TransportNegotiator::new(factory.clone());
        let result = negotiator
            .negotiate(&EndpointDescriptor::http("remote", "not a url"))
            .await;

        assert!(matches!(result, Err(NegotiationError::InvalidDescriptor(_))));
        assert!(factory.attempts().is_empty());
    }
}
