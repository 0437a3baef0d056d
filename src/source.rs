//! Source contract implemented by backend connectors
//!
//! A [`RepositorySource`] is the named, configurable entry point to one
//! backend content store. It opens raw connections on demand; pooling is
//! layered on top by handing the source to a
//! [`crate::RepositoryConnectionPool`], which any source can serve directly
//! as its [`ConnectionFactory`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::RepositoryConnection;
use crate::error::Result;
use crate::pool::ConnectionFactory;

/// Retry limit for newly configured sources.
pub const DEFAULT_RETRY_LIMIT: u32 = 0;

/// Capability flags advertised by a repository source.
///
/// Callers inspect these before attempting operations a backend may not
/// support; the pool itself never consults them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    same_name_siblings: bool,
    updates: bool,
    events: bool,
    creating_workspaces: bool,
    references: bool,
}

impl SourceCapabilities {
    /// Capabilities with every flag chosen explicitly.
    pub fn new(
        same_name_siblings: bool,
        updates: bool,
        events: bool,
        creating_workspaces: bool,
        references: bool,
    ) -> Self {
        Self {
            same_name_siblings,
            updates,
            events,
            creating_workspaces,
            references,
        }
    }

    /// Whether siblings under one parent may share a name.
    pub fn supports_same_name_siblings(&self) -> bool {
        self.same_name_siblings
    }

    /// Whether content can be modified, or is read-only.
    pub fn supports_updates(&self) -> bool {
        self.updates
    }

    /// Whether the source publishes change events.
    pub fn supports_events(&self) -> bool {
        self.events
    }

    /// Whether clients may create new workspaces.
    pub fn supports_creating_workspaces(&self) -> bool {
        self.creating_workspaces
    }

    /// Whether the source stores references between nodes.
    pub fn supports_references(&self) -> bool {
        self.references
    }
}

impl Default for SourceCapabilities {
    /// Same-name siblings and updates, nothing else.
    fn default() -> Self {
        Self::new(true, true, false, false, false)
    }
}

/// A named source of repository connections.
///
/// `get_connection` opens a fresh connection each call; reuse comes from
/// wrapping the source in a pool. The retry limit is advisory: it tells
/// callers how many times an operation against this source is worth
/// retrying after a connection-level failure.
#[async_trait]
pub trait RepositorySource: Send + Sync + 'static {
    /// Name identifying this source in logs and errors; never empty.
    fn name(&self) -> &str;

    /// How many times callers should retry failed operations.
    fn retry_limit(&self) -> u32;

    /// Set the advisory retry limit.
    fn set_retry_limit(&self, limit: u32);

    /// What this source can and cannot do.
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    /// Open a new connection to this source.
    async fn get_connection(&self) -> Result<Arc<dyn RepositoryConnection>>;
}

#[async_trait]
impl<S: RepositorySource + ?Sized> ConnectionFactory for S {
    fn source_name(&self) -> &str {
        self.name()
    }

    async fn create_connection(&self) -> Result<Arc<dyn RepositoryConnection>> {
        self.get_connection().await
    }
}
