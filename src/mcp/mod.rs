//! Model Context Protocol connection lifecycle: descriptors, transports,
//! negotiation, the connection registry, catalogs and invocation.

pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod invoker;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use catalog::CapabilityCatalog;
pub use descriptor::{EndpointDescriptor, TransportConfig, TransportKind};
pub use invoker::{ContentItem, ToolCall, ToolInvoker, ToolResult};
pub use registry::{Connection, ConnectionOutcome, ConnectionRegistry};
