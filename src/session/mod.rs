//! Session front: MCP-over-SSE sessions served per FunctionGroup.

pub mod front;
pub mod gateway;
pub mod protocol;

pub use gateway::{router, serve, GatewayState};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
