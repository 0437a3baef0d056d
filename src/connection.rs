//! Connection and command contracts implemented by repository backends
//!
//! A backend adapter (relational store, versioned filesystem, plain
//! filesystem, ...) plugs into the pool by implementing
//! [`RepositoryConnection`]. The pool never looks inside a connection; it
//! only pings it, hands it to callers, and closes it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Caller-supplied context passed along with every executed command.
///
/// Carries the identity on whose behalf commands run; backends may use it
/// for access checks and audit logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    subject: Option<String>,
}

impl ExecutionContext {
    /// An anonymous context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context acting on behalf of the named subject.
    pub fn with_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }

    /// The subject this context acts for, if any.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }
}

/// A unit of work submitted to a repository connection.
///
/// Paths use `/`-separated segments. Backends that do not support an
/// operation reject it with [`crate::Error::Repository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryCommand {
    /// Store `value` at `path`, replacing any existing value.
    Write { path: String, value: Vec<u8> },
    /// Fetch the value stored at `path`.
    Read { path: String },
    /// Delete the node at `path` and everything beneath it.
    Remove { path: String },
}

/// The outcome of a successfully executed [`RepositoryCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The command completed without producing a value.
    Done,
    /// The value read, or `None` if the path does not exist.
    Value(Option<Vec<u8>>),
}

/// A live connection to a backend content store.
///
/// Implementations must be safe to share across tasks; connections that
/// carry mutable session state should guard it internally.
#[async_trait]
pub trait RepositoryConnection: Send + Sync {
    /// Name of the source this connection belongs to; never empty.
    fn source_name(&self) -> &str;

    /// Liveness check. Returns `Ok(true)` if the connection answered within
    /// `timeout`, `Ok(false)` if it is known to be unusable.
    async fn ping(&self, timeout: Duration) -> Result<bool>;

    /// Execute a single command against the backend.
    async fn execute(
        &self,
        context: &ExecutionContext,
        command: &RepositoryCommand,
    ) -> Result<CommandResult>;

    /// Release the backend resources held by this connection.
    async fn close(&self) -> Result<()>;
}
