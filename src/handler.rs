//! Concrete feature layers over the engine: a [`server::Server`] exposing
//! tools, prompts and resources, and a [`client::Client`] exposing roots,
//! sampling and elicitation.

#[cfg(feature = "client")]
pub mod client;
pub mod registry;
#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub use client::{Client, ClientOptions};
#[cfg(feature = "server")]
pub use server::{Server, ServerOptions, ToolError};
