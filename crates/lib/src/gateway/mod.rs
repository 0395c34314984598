//! Gateway: the public relay side of the tunnel.
//!
//! Single port serves HTTP and WebSocket. A client attaches to a tunnel over
//! `/api/tunnels/{name}/connect`; public requests for that tunnel are forwarded over the
//! connection as protocol messages and the streamed replies are returned to the caller.

mod error;
mod registry;
mod server;
mod tunnel;

pub use error::GatewayError;
pub use registry::TunnelRegistry;
pub use server::{router, run_gateway, GatewayState};
pub use tunnel::{
    BodyStream, ConnectionId, Outbound, PendingResponse, ProxiedRequest, ResponseHead,
    TunnelHandle, TunnelStatus,
};
