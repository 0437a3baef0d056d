//! In-memory repository source
//!
//! A small, fully functional content store keyed by `/`-separated paths.
//! Useful as the reference connector implementation and for exercising the
//! pool in tests without a real backend. All connections opened from one
//! source share its content.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::connection::{CommandResult, ExecutionContext, RepositoryCommand, RepositoryConnection};
use crate::error::{Error, Result};
use crate::source::{RepositorySource, SourceCapabilities};

type Content = Arc<RwLock<HashMap<String, Vec<u8>>>>;

/// A repository source backed by process memory.
pub struct InMemorySource {
    name: String,
    retry_limit: AtomicU32,
    content: Content,
}

impl InMemorySource {
    /// Create an empty in-memory source with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_limit: AtomicU32::new(crate::source::DEFAULT_RETRY_LIMIT),
            content: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of nodes currently stored.
    pub fn len(&self) -> usize {
        self.content.read().len()
    }

    /// Whether the store holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.content.read().is_empty()
    }
}

#[async_trait]
impl RepositorySource for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_limit(&self) -> u32 {
        self.retry_limit.load(Ordering::Relaxed)
    }

    fn set_retry_limit(&self, limit: u32) {
        self.retry_limit.store(limit, Ordering::Relaxed);
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::new(true, true, false, false, false)
    }

    async fn get_connection(&self) -> Result<Arc<dyn RepositoryConnection>> {
        log::debug!("Opening in-memory connection to {}", self.name);
        Ok(Arc::new(InMemoryConnection {
            source_name: self.name.clone(),
            content: Arc::clone(&self.content),
            open: AtomicBool::new(true),
        }))
    }
}

/// A connection into an [`InMemorySource`].
pub struct InMemoryConnection {
    source_name: String,
    content: Content,
    open: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Repository(format!(
                "connection to {} has been closed",
                self.source_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryConnection for InMemoryConnection {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn ping(&self, _timeout: Duration) -> Result<bool> {
        Ok(self.open.load(Ordering::Acquire))
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        command: &RepositoryCommand,
    ) -> Result<CommandResult> {
        self.ensure_open()?;
        match command {
            RepositoryCommand::Write { path, value } => {
                self.content.write().insert(path.clone(), value.clone());
                Ok(CommandResult::Done)
            }
            RepositoryCommand::Read { path } => {
                Ok(CommandResult::Value(self.content.read().get(path).cloned()))
            }
            RepositoryCommand::Remove { path } => {
                let prefix = format!("{path}/");
                self.content
                    .write()
                    .retain(|key, _| key != path && !key.starts_with(&prefix));
                Ok(CommandResult::Done)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}
