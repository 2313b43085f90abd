//! # PetalFlow: a workflow engine for LLM-augmented pipelines
//!
//! A directed graph of typed nodes — LLM calls, tool invocations, routers,
//! transforms, guardians, webhooks — traverses a shared [`Envelope`] of
//! variables, messages, and artifacts. This crate covers the execution core
//! and the tool integration plane: the CLI/daemon surface, graph authoring
//! DSLs, storage driver selection, and observability sinks are external
//! collaborators that build on the contracts defined here.
//!
//! ## Quick Start
//!
//! ```
//! use petalflow::envelope::{Envelope, Value};
//! use petalflow::graph::{Graph, END};
//! use petalflow::node::{Node, NodeContext, RunError};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct GreetNode;
//!
//! #[async_trait]
//! impl Node for GreetNode {
//!     async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
//!         let name = env.get_var("name").and_then(Value::as_str).unwrap_or("world").to_string();
//!         env.set_var("greeting", Value::String(format!("Hello, {name}!")));
//!         Ok(env)
//!     }
//! }
//!
//! let _graph = Graph::builder()
//!     .entry("greet")
//!     .add_node("greet", Arc::new(GreetNode))
//!     .add_edge("greet", END)
//!     .compile()
//!     .unwrap();
//! ```
//!
//! ## Module Guide
//!
//! - [`envelope`] — the mutable per-run state container
//! - [`node`] — the node/router trait contract
//! - [`graph`] — graph construction and compilation
//! - [`runtime`] — the sequential scheduler
//! - [`events`] — structured observability events
//! - [`llm`] — LLM client contract and request/response types
//! - [`nodes`] — concrete node kinds (llm, tool, router, transform, guardian, webhook, func)
//! - [`tools`] — manifests, overlays, registry, and the adapter plane
//! - [`secret`] — secret-at-rest codec for persisted tool config
//! - [`config`] — runtime configuration from environment
//! - [`telemetry`] — tracing subscriber setup
//! - [`util`] — dot-path navigation and deep-merge helpers

pub mod config;
pub mod envelope;
pub mod events;
pub mod graph;
pub mod llm;
pub mod node;
pub mod nodes;
pub mod runtime;
pub mod secret;
pub mod telemetry;
pub mod tools;
pub mod util;

pub use envelope::Envelope;
pub use graph::Graph;
pub use node::{Node, NodeContext, Router};
