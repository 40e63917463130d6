//! Purpose: Public connection handle that owns a backend and its lookaside store.
//! Exports: `Connection`, `ApiResult`.
//! Role: Embedder-facing entry point; hands out sessions and lookaside cursors.
//! Invariants: The lookaside store lives exactly as long as the connection.
//! Invariants: Closing (or dropping) the connection destroys the store once.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::core::backend::StorageBackend;
use crate::core::error::Error;
use crate::core::lookaside::{LookasideCursor, LookasideStatsSnapshot, LookasideStore};
use crate::core::session::Session;

pub type ApiResult<T> = Result<T, Error>;

pub struct Connection<B: StorageBackend> {
    backend: Arc<B>,
    config: ConnectionConfig,
    lookaside: LookasideStore<B>,
    closed: bool,
}

impl<B: StorageBackend> Connection<B> {
    pub fn open(backend: B, config: ConnectionConfig) -> ApiResult<Self> {
        let backend = Arc::new(backend);
        let lookaside = LookasideStore::new(Arc::clone(&backend), config.lookaside.table_name.clone());
        let connection = Self {
            backend,
            config,
            lookaside,
            closed: false,
        };
        if connection.config.lookaside.warm_on_open {
            connection.lookaside.create()?;
        }
        info!(table = connection.lookaside.table_name(), "connection opened");
        Ok(connection)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn lookaside(&self) -> &LookasideStore<B> {
        &self.lookaside
    }

    pub fn open_session(&self, name: impl Into<String>) -> Session {
        Session::new(name)
    }

    /// Borrows the lookaside cursor on behalf of `session`; see [`LookasideStore::acquire`].
    pub fn lookaside_cursor<'a>(
        &'a self,
        session: &'a mut Session,
    ) -> ApiResult<LookasideCursor<'a, B::Cursor>> {
        self.lookaside.acquire(session)
    }

    pub fn stats(&self) -> LookasideStatsSnapshot {
        self.lookaside.stats()
    }

    pub fn close(mut self) -> ApiResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ApiResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.lookaside.destroy();
        info!(table = self.lookaside.table_name(), "connection closed");
        result
    }
}

impl<B: StorageBackend> Drop for Connection<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "lookaside teardown failed during connection drop");
        }
    }
}
