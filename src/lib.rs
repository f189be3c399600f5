//! # meshcore-gateway - Connection manager and RPC passthrough for MeshCore radios
//!
//! A long-running service that keeps one TCP connection to a MeshCore companion
//! radio alive, publishes its state to a durable status surface, and lets external
//! callers invoke any device method by name.
//!
//! ## Features
//!
//! - **Self-healing connection**: fixed-interval reconnect, at most one live link.
//! - **Contact snapshot**: refreshed on connect and periodically while connected.
//! - **Generic RPC**: methods are discovered at runtime; the gateway has no
//!   per-method code.
//! - **Durable status**: connection flag, last error and last RPC outcome survive restarts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcore_gateway::config::Config;
//! use meshcore_gateway::gateway::RpcRequest;
//! use meshcore_gateway::lifecycle::start_service;
//! use meshcore_gateway::meshcore::MeshCoreFactory;
//! use meshcore_gateway::status::StatusStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let sink = StatusStore::open(config.status.path()).await?;
//!     let factory = MeshCoreFactory::new(config.meshcore.client_options());
//!
//!     let service = start_service(
//!         config.meshcore.connection_config(),
//!         Arc::new(factory),
//!         Arc::new(sink),
//!     );
//!     let outcome = service.invoke(RpcRequest::new("getContacts", vec![])).await;
//!     println!("{}", outcome.to_response());
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`lifecycle`] - connection state machine, reconnect timer, refresh scheduler
//! - [`gateway`] - RPC passthrough and method catalog
//! - [`transport`] - transport client trait and capability tables
//! - [`meshcore`] - MeshCore companion TCP client
//! - [`status`] - status sink trait, durable store
//! - [`control`] - line-delimited JSON command server
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │ Control Server  │ ───▶ │ ServiceHandle   │
//! └─────────────────┘      └─────────────────┘
//!                                   │ commands
//!                          ┌─────────────────┐      ┌──────────────┐
//!                          │ Lifecycle owner │ ───▶ │ Status Sink  │
//!                          └─────────────────┘      └──────────────┘
//!                                   │ capabilities / events
//!                          ┌─────────────────┐
//!                          │ MeshCore client │
//!                          └─────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod gateway;
pub mod lifecycle;
pub mod logutil;
pub mod meshcore;
pub mod status;
pub mod transport;
