//! Safe wrapper around a `SQLite` database connection.
//!
//! This file contains **no `unsafe` code**. All FFI interaction is delegated to
//! [`ffi::RawDb`] which encapsulates the raw pointers and C type conversions.

use std::cell::RefCell;
use std::ops::BitOr;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use super::busy::{BusyCallback, BusyPolicy, TimeoutBackoff};
use super::error::{DbError, DbResult, Handle, BINDING_ERROR};
use super::ffi::{self, InterruptHandle, RawDb};
use super::function::{
    FinalizeCallback, FunctionCallback, FunctionContext, FunctionRecord, FunctionRegistry,
    FunctionType,
};
use super::statement::Statement;

/// Native open flags accepted by [`Connection::open_with_flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(i32);

impl OpenFlags {
    /// Open for reading only.
    pub const READ_ONLY: Self = Self(ffi::SQLITE_OPEN_READONLY);
    /// Open for reading and writing.
    pub const READ_WRITE: Self = Self(ffi::SQLITE_OPEN_READWRITE);
    /// Create the file if it does not exist. Requires `READ_WRITE`.
    pub const CREATE: Self = Self(ffi::SQLITE_OPEN_CREATE);
    /// Interpret the path as a URI.
    pub const URI: Self = Self(ffi::SQLITE_OPEN_URI);
    /// Open an in-memory database named by the path.
    pub const MEMORY: Self = Self(ffi::SQLITE_OPEN_MEMORY);
    /// Multi-thread threading mode.
    pub const NO_MUTEX: Self = Self(ffi::SQLITE_OPEN_NOMUTEX);
    /// Serialized threading mode.
    pub const FULL_MUTEX: Self = Self(ffi::SQLITE_OPEN_FULLMUTEX);

    const ACCESS: i32 =
        ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
    const KNOWN: i32 = Self::ACCESS
        | ffi::SQLITE_OPEN_URI
        | ffi::SQLITE_OPEN_MEMORY
        | ffi::SQLITE_OPEN_NOMUTEX
        | ffi::SQLITE_OPEN_FULLMUTEX;

    /// Validates an integer open mode. Zero selects the default flags.
    pub fn from_mode(mode: i32) -> DbResult<Self> {
        if mode == 0 {
            return Ok(Self::default());
        }
        let unknown = mode & !Self::KNOWN;
        if unknown != 0 {
            return Err(DbError::open(
                BINDING_ERROR,
                format!("unrecognized open mode bits {unknown:#x}"),
            ));
        }
        let access = mode & Self::ACCESS;
        let valid_access = access == ffi::SQLITE_OPEN_READONLY
            || access == ffi::SQLITE_OPEN_READWRITE
            || access == ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        if !valid_access {
            return Err(DbError::open(
                BINDING_ERROR,
                format!("invalid access mode {access:#x} in open mode {mode:#x}"),
            ));
        }
        let mutexes = ffi::SQLITE_OPEN_NOMUTEX | ffi::SQLITE_OPEN_FULLMUTEX;
        if mode & mutexes == mutexes {
            return Err(DbError::open(
                BINDING_ERROR,
                format!("conflicting threading modes in open mode {mode:#x}"),
            ));
        }
        Ok(Self(mode))
    }

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// Returns `true` if all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ_WRITE | Self::CREATE | Self::FULL_MUTEX
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A `SQLite` database connection.
///
/// Closed by [`close`](Self::close) or when dropped, whichever comes first.
/// After `close` every operation fails with [`DbError::ClosedHandle`].
///
/// Not `Send` or `Sync`: registered callbacks are single-threaded host
/// closures, so all access must happen from the thread that opened it.
/// Use [`interrupt_handle`](Self::interrupt_handle) to cancel work from
/// another thread.
pub struct Connection {
    // Declared first so the native handle is released before the callbacks
    // it may still reference.
    db: Option<RawDb>,
    path: String,
    functions: RefCell<FunctionRegistry>,
}

impl Connection {
    /// Opens (or creates) the database at `path`.
    ///
    /// `mode` is a combination of native open flags; `0` selects
    /// [`OpenFlags::default`].
    pub fn open(path: impl AsRef<Path>, mode: i32) -> DbResult<Self> {
        Self::open_with_flags(path, OpenFlags::from_mode(mode)?)
    }

    /// Opens the database at `path` with explicit flags.
    pub fn open_with_flags(path: impl AsRef<Path>, flags: OpenFlags) -> DbResult<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        if path.is_empty() {
            return Err(DbError::open(BINDING_ERROR, "database path must not be empty"));
        }
        let db = RawDb::open(&path, flags.bits()).inspect_err(|e| {
            tracing::debug!(path = %path, error = %e, "open failed");
        })?;
        tracing::debug!(path = %path, flags = flags.bits(), "opened database");
        Ok(Self {
            db: Some(db),
            path,
            functions: RefCell::new(FunctionRegistry::default()),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::open(":memory:", 0)
    }

    /// Closes the connection.
    ///
    /// Fails with [`DbError::ClosedHandle`] if it is already closed.
    pub fn close(&mut self) -> DbResult<()> {
        let db = self.db.take().ok_or(DbError::ClosedHandle(Handle::Database))?;
        let result = db.close();
        tracing::debug!(path = %self.path, "closed database");
        result
    }

    /// Returns `true` once the connection has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.db.is_none()
    }

    /// Path the connection was opened with.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn handle(&self) -> DbResult<&RawDb> {
        self.db.as_ref().ok_or(DbError::ClosedHandle(Handle::Database))
    }

    /// Compiles the first statement in `sql`.
    ///
    /// Returns the statement and the text following it (possibly empty).
    pub fn compile(&self, sql: &str) -> DbResult<(Statement<'_>, String)> {
        let (raw, consumed) = self.handle()?.prepare(sql).inspect_err(|e| {
            tracing::debug!(error = %e, "compile failed");
        })?;
        let remainder = sql.get(consumed..).unwrap_or_default().to_string();
        Ok((Statement::new(raw), remainder))
    }

    /// Executes one or more SQL statements separated by semicolons.
    ///
    /// No result rows are returned. Registered functions and the busy handler
    /// may be invoked while it runs.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.handle()?.exec(sql)
    }

    /// Returns the rowid of the most recent successful INSERT.
    pub fn last_insert_row_id(&self) -> DbResult<i64> {
        Ok(self.handle()?.last_insert_rowid())
    }

    /// Returns the number of rows changed by the most recent statement.
    pub fn changes(&self) -> DbResult<i64> {
        Ok(self.handle()?.changes())
    }

    /// Requests that the running operation abort at its next opportunity.
    pub fn interrupt(&self) -> DbResult<()> {
        self.handle()?.interrupt();
        Ok(())
    }

    /// Returns a handle that can interrupt this connection from another
    /// thread or from inside a callback.
    pub fn interrupt_handle(&self) -> DbResult<InterruptHandle> {
        Ok(self.handle()?.interrupt_handle())
    }

    /// Installs a busy handler, or restores the default (fail immediately)
    /// with `None`. Replaces any busy timeout.
    pub fn busy_handler(&mut self, handler: Option<Box<BusyCallback>>) -> DbResult<()> {
        let policy = handler.map(|callback| BusyPolicy::Handler {
            resource: self.path.clone(),
            callback,
        });
        self.install_busy_policy(policy)
    }

    /// Retries busy resources with backoff for up to `ms` milliseconds per
    /// request. Zero restores the default. Replaces any busy handler.
    pub fn busy_timeout(&mut self, ms: u32) -> DbResult<()> {
        let policy = (ms > 0).then(|| {
            BusyPolicy::Timeout(TimeoutBackoff::new(Duration::from_millis(u64::from(ms))))
        });
        self.install_busy_policy(policy)
    }

    fn install_busy_policy(&mut self, policy: Option<BusyPolicy>) -> DbResult<()> {
        self.db
            .as_mut()
            .ok_or(DbError::ClosedHandle(Handle::Database))?
            .set_busy_policy(policy)
    }

    /// Registers a scalar SQL function. `arity` is the number of arguments,
    /// or `-1` for any number.
    ///
    /// The closure receives the call context and the arguments as text
    /// (`None` for NULL) and reports its value through
    /// [`FunctionContext::set_result`]. If it returns an error or panics, the
    /// SQL call fails with a fixed diagnostic instead.
    pub fn create_function<F>(&self, name: &str, arity: i32, function: F) -> DbResult<()>
    where
        F: Fn(&mut FunctionContext<'_>, &[Option<String>]) -> DbResult<()> + 'static,
    {
        let function: Box<FunctionCallback> = Box::new(function);
        let record = FunctionRecord::scalar(name, arity, function);
        self.register(record, "create function", name, arity)
    }

    /// Registers an aggregate SQL function.
    ///
    /// `step` runs once per row of a group; `finalize` runs once per group
    /// and sets the aggregate's result. Per-group state is available through
    /// [`FunctionContext::aggregate_context`].
    pub fn create_aggregate<S, F>(
        &self,
        name: &str,
        arity: i32,
        step: S,
        finalize: F,
    ) -> DbResult<()>
    where
        S: Fn(&mut FunctionContext<'_>, &[Option<String>]) -> DbResult<()> + 'static,
        F: Fn(&mut FunctionContext<'_>) -> DbResult<()> + 'static,
    {
        let step: Box<FunctionCallback> = Box::new(step);
        let finalize: Box<FinalizeCallback> = Box::new(finalize);
        let record = FunctionRecord::aggregate(name, arity, step, finalize);
        self.register(record, "create aggregate", name, arity)
    }

    fn register(&self, record: FunctionRecord, what: &str, name: &str, arity: i32) -> DbResult<()> {
        let record = Rc::new(record);
        let rc = self.handle()?.create_function(name, arity, &record)?;
        if rc != ffi::SQLITE_OK {
            return Err(DbError::new(rc, format!("{what} {name}({arity})")));
        }
        self.functions.borrow_mut().insert(record);
        Ok(())
    }

    /// Declares the result type of every registered function called `name`.
    pub fn function_type(&self, name: &str, result_type: FunctionType) -> DbResult<()> {
        self.handle()?;
        self.functions.borrow().set_function_type(name, result_type)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
