//! Database access gateway for document and relational stores.
//!
//! Callers address a backend by connection id. The gateway resolves the id
//! through a user-scoped [`DescriptorStore`](database::DescriptorStore),
//! admits the request through a fixed-window [`RateLimiter`], reuses or
//! builds a pooled connection, and sanitizes the payload before the backend
//! sees it.
//!
//! # Example
//!
//! ```no_run
//! use db_gateway::{
//!     config::GatewayConfigBuilder,
//!     database::{BackendKind, ConnectionDescriptor, InMemoryDescriptorStore},
//!     gateway::{Gateway, RequestContext},
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = InMemoryDescriptorStore::new();
//!     store.insert(
//!         "alice",
//!         ConnectionDescriptor::new("orders", BackendKind::Document).host("localhost"),
//!     )?;
//!
//!     let gateway = Gateway::builder()
//!         .config(GatewayConfigBuilder::new().from_env()?.build()?)
//!         .store(Arc::new(store))
//!         .build()?;
//!
//!     let ctx = RequestContext::for_user("alice");
//!     let page = gateway
//!         .find_documents(&ctx, "orders", "shop", "orders", &json!({"limit": 10}))
//!         .await?;
//!     println!("{} of {} orders", page.documents.len(), page.total);
//!
//!     gateway.close_all().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod security;

pub use config::{GatewayConfig, GatewayConfigBuilder, TimeoutConfig};
pub use database::{
    BackendKind, ConnectionBuilder, ConnectionDescriptor, ConnectionRegistry, Connector,
    DescriptorStore, InMemoryDescriptorStore,
};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder, RequestContext};
pub use protocol::GatewayService;
pub use security::{DocumentQuerySanitizer, RateLimiter, StatementGuard};
