//! synse-core - Core traits and types for the synse plugin gateway
//!
//! This crate provides the abstractions shared by the gateway and the
//! plugin links that carry its remote calls: the data model, the error
//! taxonomy, tag parsing, and the [`PluginClient`] trait.

pub mod error;
pub mod models;
pub mod plugin;
pub mod tags;

pub use error::{GatewayError, GatewayResult};
pub use models::*;
pub use plugin::{Connector, PluginClient, RpcMethod, StatusStream};
