// ABOUTME: Remote SQL proxy module
// ABOUTME: Defines the proxy seam used by the import core and its HTTP implementation

pub mod client;
pub mod models;

use anyhow::Result;
use futures::future::BoxFuture;

pub use client::RemoteClient;
pub use models::{
    ConnectionDescriptor, ConnectionTestResult, ExecuteDetails, ExecuteOptions, ExecuteRequest,
    ExecuteResponse, StatementFailure,
};

/// Executes SQL against an external connection on behalf of the importer.
///
/// An `Err` is a transport or infrastructure failure; statement-level failures
/// come back inside `ExecuteResponse::details`.
pub trait SqlProxy: Send + Sync {
    fn test<'a>(
        &'a self,
        connection: &'a ConnectionDescriptor,
    ) -> BoxFuture<'a, Result<ConnectionTestResult>>;

    fn execute<'a>(&'a self, request: &'a ExecuteRequest) -> BoxFuture<'a, Result<ExecuteResponse>>;
}
