//! Grid Server Client
//!
//! Everything needed to talk to a running Grid Server:
//! - `GridServerRpc`: one method per Grid Server operation
//! - `SoapClient`: the SOAP-over-HTTP implementation of that interface
//! - `ExecutionPlan` and the HTTP handlers it is assembled from
//! - `CircuitBreaker` / `CircuitBreakerPolicy` and the guarded RPC wrapper
//!
//! # Example
//!
//! ```no_run
//! use grid_client::{GridServerRpc, HttpClient, SoapClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> grid_client::Result<()> {
//!     let http = HttpClient::builder().with_logging().build()?;
//!     let rpc = SoapClient::for_port(45000, http, Duration::from_secs(5));
//!
//!     println!("Grid Server version: {}", rpc.get_version().await?);
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod rpc;
pub mod soap;

// Re-export commonly used types
pub use breaker::{CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerSettings, GuardedRpc};
pub use error::{ClientError, Result};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use pipeline::{ExecutionContext, ExecutionPlan, Next, PipelineHandler};
pub use rpc::GridServerRpc;
pub use soap::SoapClient;
