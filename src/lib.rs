//! Connection pooling and lifecycle management for heterogeneous content
//! repository sources.
//!
//! The crate is organized around a small set of contracts:
//! - `connection`: the [`RepositoryConnection`] and command contracts a
//!   backend adapter (relational, versioned, filesystem, ...) implements
//! - `source`: the named [`RepositorySource`] entry point to one backend
//! - `pool`: the [`RepositoryConnectionPool`] engine that brokers bounded,
//!   validated, reusable connections between callers and a source
//! - `memory`: an in-memory reference connector
//!
//! A typical setup wraps a source in a pool and checks connections out:
//!
//! ```
//! use std::sync::Arc;
//! use repopool::{InMemorySource, RepositoryConnectionPool};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> repopool::Result<()> {
//! let source = Arc::new(InMemorySource::new("store"));
//! let pool = RepositoryConnectionPool::new(source)?;
//! let mut conn = pool.get_connection().await?;
//! // ... execute commands ...
//! conn.close().await?;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod memory;
pub mod pool;
pub mod source;

// Re-export commonly used types for easy access
pub use connection::{CommandResult, ExecutionContext, RepositoryCommand, RepositoryConnection};
pub use error::{Error, Result};
pub use memory::{InMemoryConnection, InMemorySource};
pub use pool::{
    ConnectionFactory, PoolConfig, PoolStats, PooledConnection, RepositoryConnectionPool, RunState,
};
pub use source::{RepositorySource, SourceCapabilities};
