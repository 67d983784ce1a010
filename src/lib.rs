//! mcp-relay connects an LLM chat stream to Model Context Protocol tool
//! providers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the provider connection lifecycle: endpoint descriptors,
//!   the stdio, event-stream and streamable HTTP transports, transport
//!   negotiation with fallback, the connection registry, capability catalogs
//!   and tool/prompt/resource invocation.
//! - [`relay`] drives one model generation per chat turn, declares the
//!   enabled providers' tools and multiplexes text and tool calls into one
//!   ordered event stream.
//! - [`server`] exposes both over HTTP.
//! - [`api`] defines the OpenAI-compatible chat payloads.
//! - [`core`] holds configuration.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod relay;
pub mod server;
pub mod utils;
