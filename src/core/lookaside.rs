//! Purpose: Own the connection's lookaside store: lazy creation, exclusive lending, and teardown.
//! Exports: `LookasideStore`, `LookasideCursor`, `LookasidePresence`, `LookasideStats`, `LookasideStatsSnapshot`.
//! Role: The only path to the lookaside cursor; eviction and history readers borrow it here.
//! Invariants: The dedicated session and the cursor are created, published, and cleared together.
//! Invariants: The cursor is reachable only through the lock guard held by a `LookasideCursor`.
//! Invariants: A borrower's session flags are restored exactly on release, including on error and unwind.
//! Invariants: The presence flag drops to false before the table is dropped.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::backend::{CursorOptions, StorageBackend, TableCursor};
use crate::core::error::{keep_first, Error, ErrorKind};
use crate::core::record::TableFormat;
use crate::core::session::{Session, SessionFlags};
use crate::core::table::TableFlags;

pub const DEFAULT_TABLE_NAME: &str = "lookaside.las";
const INTERNAL_SESSION_NAME: &str = "lookaside table";

struct LookasideHandle<C> {
    session: Session,
    cursor: C,
}

/// Lock-free view of whether the lookaside table is live.
///
/// Block-free paths use this to decide whether freed blocks must be recorded
/// in the lookaside table.
#[derive(Clone, Debug)]
pub struct LookasidePresence(Arc<AtomicBool>);

impl LookasidePresence {
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct LookasideStats {
    creates: AtomicU64,
    create_failures: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    reset_failures: AtomicU64,
    destroys: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LookasideStatsSnapshot {
    pub creates: u64,
    pub create_failures: u64,
    pub acquires: u64,
    pub releases: u64,
    pub reset_failures: u64,
    pub destroys: u64,
}

impl LookasideStats {
    pub fn snapshot(&self) -> LookasideStatsSnapshot {
        LookasideStatsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            reset_failures: self.reset_failures.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct LookasideStore<B: StorageBackend> {
    backend: Arc<B>,
    table: String,
    open: Arc<AtomicBool>,
    inner: Mutex<Option<LookasideHandle<B::Cursor>>>,
    stats: LookasideStats,
}

impl<B: StorageBackend> LookasideStore<B> {
    pub fn new(backend: Arc<B>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            open: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(None),
            stats: LookasideStats::default(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn presence(&self) -> LookasidePresence {
        LookasidePresence(Arc::clone(&self.open))
    }

    pub fn stats(&self) -> LookasideStatsSnapshot {
        self.stats.snapshot()
    }

    /// Creates the lookaside table and its cursor unless another caller already did.
    pub fn create(&self) -> Result<(), Error> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Ok(());
        }

        match self.build() {
            Ok(handle) => {
                *slot = Some(handle);
                self.open.store(true, Ordering::Release);
                LookasideStats::bump(&self.stats.creates);
                info!(table = %self.table, "lookaside store created");
                Ok(())
            }
            Err(err) => {
                LookasideStats::bump(&self.stats.create_failures);
                warn!(table = %self.table, error = %err, "lookaside store creation failed");
                Err(err)
            }
        }
    }

    fn build(&self) -> Result<LookasideHandle<B::Cursor>, Error> {
        let mut session = Session::internal(INTERNAL_SESSION_NAME);

        // A crash can leave a previous incarnation behind.
        let cursor = self
            .backend
            .drop_table(&self.table, true)
            .and_then(|()| {
                self.backend
                    .create_table(&self.table, &TableFormat::lookaside())
            })
            .and_then(|()| {
                self.backend
                    .open_cursor(&session, &self.table, CursorOptions { overwrite: false })
            });
        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(err) => {
                self.discard(session, None);
                return Err(err.with_table(&self.table));
            }
        };

        let flags = TableFlags::LOOKASIDE | TableFlags::NO_CHECKPOINT | TableFlags::NO_LOGGING;
        if let Err(err) = self.backend.set_table_flags(&self.table, flags) {
            self.discard(session, Some(cursor));
            return Err(err.with_table(&self.table));
        }
        session.insert_flags(SessionFlags::NO_EVICTION);

        Ok(LookasideHandle { session, cursor })
    }

    fn discard(&self, session: Session, cursor: Option<B::Cursor>) {
        if let Err(err) = self.backend.close_session(session, cursor) {
            warn!(table = %self.table, error = %err, "closing half-built lookaside session failed");
        }
    }

    /// Borrows the lookaside cursor, creating the store on first use.
    ///
    /// Blocks until no other caller holds the cursor. The returned guard holds
    /// the store lock and has set `NO_EVICTION` on `session` until it is released
    /// or dropped.
    pub fn acquire<'a>(
        &'a self,
        session: &'a mut Session,
    ) -> Result<LookasideCursor<'a, B::Cursor>, Error> {
        if !self.open.load(Ordering::Acquire) {
            self.create()?;
        }

        let guard = self.inner.lock();
        let handle = MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("lookaside store is closed")
                .with_table(&self.table)
        })?;
        let cursor = MappedMutexGuard::map(handle, |handle| &mut handle.cursor);

        let saved_flags = session.flags();
        session.insert_flags(SessionFlags::NO_EVICTION);
        LookasideStats::bump(&self.stats.acquires);
        debug!(session = session.id(), "lookaside cursor acquired");

        Ok(LookasideCursor {
            cursor,
            session,
            saved_flags,
            stats: &self.stats,
            released: false,
        })
    }

    pub fn release(&self, token: LookasideCursor<'_, B::Cursor>) -> Result<(), Error> {
        token.release()
    }

    /// Tears the store down; `&mut self` guarantees no cursor is on loan.
    ///
    /// Every step runs even when an earlier one fails; the first error is returned.
    pub fn destroy(&mut self) -> Result<(), Error> {
        let Some(LookasideHandle { session, cursor }) = self.inner.get_mut().take() else {
            return Ok(());
        };

        let mut first = None;
        let closed = self.backend.close_session(session, Some(cursor));
        if let Err(err) = &closed {
            warn!(table = %self.table, error = %err, "closing lookaside session failed");
        }
        keep_first(&mut first, closed);

        self.open.store(false, Ordering::Release);

        // TODO: discard the table's dirty blocks before dropping it once the backend grows a discard-on-close mode.
        let dropped = self.backend.drop_table(&self.table, true);
        if let Err(err) = &dropped {
            warn!(table = %self.table, error = %err, "dropping lookaside table failed");
        }
        keep_first(&mut first, dropped);

        LookasideStats::bump(&self.stats.destroys);
        info!(table = %self.table, "lookaside store destroyed");
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A borrowed lookaside cursor.
///
/// Derefs to the backend cursor. Releasing (or dropping) resets the cursor,
/// restores the borrower's session flags, then unlocks the store.
pub struct LookasideCursor<'a, C: TableCursor> {
    cursor: MappedMutexGuard<'a, C>,
    session: &'a mut Session,
    saved_flags: SessionFlags,
    stats: &'a LookasideStats,
    released: bool,
}

impl<'a, C: TableCursor> LookasideCursor<'a, C> {
    pub fn session(&self) -> &Session {
        &*self.session
    }

    /// Borrower flags captured at acquire time.
    pub fn saved_flags(&self) -> SessionFlags {
        self.saved_flags
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let reset = self.cursor.reset();
        self.session.set_flags(self.saved_flags);
        LookasideStats::bump(&self.stats.releases);
        if reset.is_err() {
            LookasideStats::bump(&self.stats.reset_failures);
        }
        debug!(session = self.session.id(), "lookaside cursor released");
        reset
    }
}

impl<'a, C: TableCursor> Deref for LookasideCursor<'a, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.cursor
    }
}

impl<'a, C: TableCursor> DerefMut for LookasideCursor<'a, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.cursor
    }
}

impl<'a, C: TableCursor> Drop for LookasideCursor<'a, C> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(session = self.session.id(), error = %err, "lookaside cursor reset failed");
        }
    }
}
