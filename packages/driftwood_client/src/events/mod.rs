//! The update channel: connection lifecycle, event protocol, and the SSE
//! transport.

pub mod manager;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod timer;

pub use manager::{
    ChannelConfig, ChannelHandle, ChannelSink, ChannelTransport, ConnectionManager,
    ConnectionStatus,
};
pub use protocol::{
    ItemUpdate, MetricsUpdate, PresenceUpdate, UpdateEvent, UpdatePayload,
};
pub use registry::SubscriberId;
pub use sse::SseTransport;
