//! synse-plugin-http - HTTP/JSON plugin link
//!
//! Implements `PluginClient` for plugins that serve the plugin API over
//! HTTP, with the transaction status call streamed as newline-delimited
//! JSON. [`HttpConnector`] plugs into the gateway for descriptors with
//! `transport = "http"`.

mod client;
mod error;
mod ndjson;

pub use client::{HttpConnector, HttpPluginClient};
pub use error::HttpLinkError;
pub use ndjson::NdjsonParser;
