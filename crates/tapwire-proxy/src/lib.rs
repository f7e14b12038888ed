mod config;
mod connection;
mod dispatch;
mod error;
mod handlers;
mod legacy;
mod passthrough;
mod pipeline;
mod recursive;
mod server;
mod timeout;

pub use config::{PassThroughConfig, ServerConfig, TimeoutConfig};
pub use connection::ConnectionState;
pub use dispatch::{
    dispatch_message, DispatchOutcome, HandlerContext, HandlerError, HttpMessageHandler,
};
pub use error::{log_classified, PipelineError, Severity};
pub use handlers::{CloseOnRecursiveRequestHandler, ConnectEstablishedHandler};
pub use legacy::LegacySocketAdapter;
pub use pipeline::{
    serve_connection, ConnectionIo, Http2Codec, Http2Io, Http2UpgradeContext,
    PipelineConfigurator, ProxyRuntime,
};
pub use recursive::is_recursive;
pub use server::{run_proxy_server, ProxyRunSummary};
