//! # Driftwood client
//!
//! Client-side network resilience and admission control for the Driftwood
//! gallery server. This crate provides:
//! - A [`ConnectionManager`] that keeps the server's update channel alive:
//!   reconnect with exponential backoff, degrade-to-polling after the
//!   attempt ceiling, and resumption from the last seen event cursor
//! - An [`AdmissionController`] that bounds concurrent requests per
//!   endpoint category, queueing the rest in arrival order
//! - Window-scoped [`ClientIdentity`] used to label presence
//! - Best-effort presence leases and leave signalling
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftwood_client::{
//!     AdmissionController, ChannelConfig, ConnectionManager, Endpoint, SseTransport,
//!     TaskOperation,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = reqwest::Client::new();
//!
//! // Keep the update channel alive; observe status and events.
//! let manager = ConnectionManager::new(
//!     ChannelConfig::new("http://127.0.0.1:8787/api/events", "tab-1"),
//!     Arc::new(SseTransport::new(client.clone())),
//! );
//! manager.subscribe_status(|status| println!("channel: {status}"));
//! manager.connect();
//!
//! // Gate a thumbnail fetch through the per-endpoint budget.
//! let admission = AdmissionController::default();
//! let ticket = admission.admit(Endpoint::Thumb, move || {
//!     let request = client.get("http://127.0.0.1:8787/api/thumb/a.jpg").send();
//!     Ok(TaskOperation::new(async move {
//!         let response = request.await?;
//!         Ok(response.bytes().await?.to_vec())
//!     }))
//! });
//! let bytes = ticket.outcome().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod events;
pub mod identity;
pub mod presence;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionLimits, AdmissionTicket, BudgetSnapshot,
    Endpoint, EndpointSnapshot, TaskHandle, TaskOperation,
};
pub use config::{DriftConfig, FileConfig, load_config};
pub use events::{
    ChannelConfig, ChannelHandle, ChannelSink, ChannelTransport, ConnectionManager,
    ConnectionStatus, SseTransport, SubscriberId, UpdateEvent, UpdatePayload,
};
pub use identity::{ClientIdentity, LegacyTokenFile, TokenStore, WindowTokenStore};
pub use presence::{
    BeaconSender, DetachedHttpSender, LeaveNotice, PresenceLease, PresenceSignal,
    UnloadSafeSender,
};
