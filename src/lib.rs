#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::SdkError;

/// Basic data types of the MCP wire protocol
pub mod model;
pub use model::ErrorData;

pub mod service;
pub use service::{
    Peer, PeerRequestOptions, QuitReason, ReceivingMiddleware, RequestContext, SendingMiddleware,
    Service, ServiceError, ServiceExt,
};
#[cfg(feature = "client")]
pub use service::{RoleClient, serve_client};
#[cfg(feature = "server")]
pub use service::{RoleServer, serve_server};

pub mod handler;
#[cfg(feature = "client")]
pub use handler::{Client, ClientOptions};
#[cfg(feature = "server")]
pub use handler::{Server, ServerOptions, ToolError};

pub mod transport;

// re-export the crates that appear in public signatures
pub use serde;
pub use serde_json;
