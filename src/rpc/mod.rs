//! JSON-RPC 2.0 服务：按行分隔的请求 / 响应，传输层为 stdio 或 TCP

pub mod protocol;
pub mod service;
pub mod transport;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcError};
pub use service::{RpcService, SUPPORTED_METHODS};
pub use transport::{serve_lines, serve_stdio, serve_tcp};
