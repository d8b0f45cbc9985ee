//! Raw FFI layer over the `SQLite` C interface.
//!
//! The symbols come from `libsqlite3-sys`, which compiles the bundled
//! amalgamation. All pointer juggling lives here: every native handle is owned
//! by exactly one wrapper and released through a single path, and the
//! `extern "C"` callback trampolines recover their host-side records from the
//! user-data pointer the engine hands back.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

use libsqlite3_sys as sys;

use super::busy::BusyPolicy;
use super::error::{DbError, DbResult};
use super::function::FunctionRecord;
use super::value::StorageClass;

pub use sys::{
    SQLITE_BUSY, SQLITE_DONE, SQLITE_ERROR, SQLITE_MISUSE, SQLITE_OK, SQLITE_OPEN_CREATE,
    SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_MEMORY, SQLITE_OPEN_NOMUTEX, SQLITE_OPEN_READONLY,
    SQLITE_OPEN_READWRITE, SQLITE_OPEN_URI, SQLITE_ROW,
};

// ── Helpers ─────────────────────────────────────────────────────────────

fn lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: callers pass NUL-terminated strings owned by the engine that
    // stay valid until the next call on the same handle.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn errmsg(db: *mut sys::sqlite3) -> String {
    // SAFETY: `db` is a live connection handle.
    lossy(unsafe { sys::sqlite3_errmsg(db) }).unwrap_or_else(|| "unknown error".to_string())
}

fn errstr(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a static string for any code.
    lossy(unsafe { sys::sqlite3_errstr(code) }).unwrap_or_else(|| format!("error code {code}"))
}

fn c_string(text: &str, what: &str) -> DbResult<CString> {
    CString::new(text).map_err(|e| DbError::new(SQLITE_ERROR, format!("nul in {what}: {e}")))
}

/// Returns the version string of the linked native library.
pub fn libversion() -> String {
    // SAFETY: returns a static string.
    lossy(unsafe { sys::sqlite3_libversion() }).unwrap_or_default()
}

/// Returns `true` if `sql` ends with a complete statement.
pub fn complete(sql: &str) -> bool {
    let Ok(c_sql) = CString::new(sql) else {
        return false;
    };
    // SAFETY: `c_sql` is NUL-terminated and outlives the call.
    unsafe { sys::sqlite3_complete(c_sql.as_ptr()) != 0 }
}

// ── Native messages ─────────────────────────────────────────────────────

/// A message allocated by the engine (the `errmsg` out-parameter of
/// `sqlite3_exec`). Freed with `sqlite3_free` when dropped, exactly once.
pub struct NativeMessage(NonNull<c_char>);

impl NativeMessage {
    /// Takes ownership of `ptr`. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a NUL-terminated string obtained from the
    /// engine's allocator, not owned by anyone else.
    unsafe fn adopt(ptr: *mut c_char) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Copies the message out.
    pub fn to_string_lossy(&self) -> String {
        lossy(self.0.as_ptr()).unwrap_or_default()
    }
}

impl Drop for NativeMessage {
    fn drop(&mut self) {
        // SAFETY: adopted from the engine's allocator; dropped once.
        unsafe { sys::sqlite3_free(self.0.as_ptr().cast()) };
    }
}

// ── Connection handle ───────────────────────────────────────────────────

struct SharedDb(*mut sys::sqlite3);

// SAFETY: only used to call `sqlite3_interrupt`, which is safe from any
// thread, and only while the mutex guarantees the handle is still open.
unsafe impl Send for SharedDb {}

/// Thread-safe handle that requests interruption of the running operation.
///
/// Becomes inert once the connection is closed.
#[derive(Clone)]
pub struct InterruptHandle {
    target: Arc<Mutex<SharedDb>>,
}

impl InterruptHandle {
    /// Asks the connection to abort its current operation at the next
    /// opportunity. The operation then fails with the `Interrupt` kind.
    pub fn interrupt(&self) {
        let guard = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.0.is_null() {
            // SAFETY: the handle is open while the guard is held; close()
            // clears it under the same lock before releasing the connection.
            unsafe { sys::sqlite3_interrupt(guard.0) };
        }
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}

/// Owning wrapper around a `sqlite3*`.
pub struct RawDb {
    db: *mut sys::sqlite3,
    interrupt: Arc<Mutex<SharedDb>>,
    /// Busy policy handed to the engine, from `Box::into_raw`; null if none.
    busy: *mut BusyPolicy,
}

impl RawDb {
    /// Opens `path` with the given native open flags.
    pub fn open(path: &str, flags: c_int) -> DbResult<Self> {
        let c_path = CString::new(path).map_err(|e| {
            DbError::open(super::error::BINDING_ERROR, format!("invalid path: {e}"))
        })?;
        let mut db: *mut sys::sqlite3 = ptr::null_mut();
        // SAFETY: `c_path` is NUL-terminated; `db` receives the new handle.
        let rc = unsafe { sys::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };
        if rc != SQLITE_OK {
            let message = if db.is_null() {
                errstr(rc)
            } else {
                let message = errmsg(db);
                // SAFETY: the handle failed to open and is released here only.
                unsafe { sys::sqlite3_close_v2(db) };
                message
            };
            return Err(DbError::open(rc, message));
        }
        Ok(Self {
            db,
            interrupt: Arc::new(Mutex::new(SharedDb(db))),
            busy: ptr::null_mut(),
        })
    }

    /// Message of the most recent failure on this connection.
    pub fn errmsg(&self) -> String {
        errmsg(self.db)
    }

    /// Runs one or more statements through `sqlite3_exec`.
    pub fn exec(&self, sql: &str) -> DbResult<()> {
        let c_sql = c_string(sql, "SQL")?;
        let mut raw_message: *mut c_char = ptr::null_mut();
        // SAFETY: live handle, NUL-terminated SQL, no row callback.
        let rc = unsafe {
            sys::sqlite3_exec(self.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut raw_message)
        };
        // SAFETY: the out-parameter is either null or ours to free.
        let message = unsafe { NativeMessage::adopt(raw_message) };
        if rc != SQLITE_OK {
            return Err(DbError::from_native(rc, message));
        }
        Ok(())
    }

    /// Compiles the first statement in `sql`. Returns the statement (`None`
    /// when the text holds no statement) and the byte offset of the unparsed
    /// remainder.
    pub fn prepare(&self, sql: &str) -> DbResult<(Option<RawStmt<'_>>, usize)> {
        let c_sql = c_string(sql, "SQL")?;
        let mut stmt: *mut sys::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: live handle; `tail` points into `c_sql`, which outlives it.
        let rc = unsafe {
            sys::sqlite3_prepare_v2(self.db, c_sql.as_ptr(), -1, &mut stmt, &mut tail)
        };
        if rc != SQLITE_OK {
            return Err(DbError::new(rc, self.errmsg()));
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            // SAFETY: both pointers belong to the same allocation.
            usize::try_from(unsafe { tail.offset_from(c_sql.as_ptr()) }).unwrap_or(sql.len())
        };
        let stmt = NonNull::new(stmt).map(|stmt| RawStmt {
            stmt,
            db: self.db,
            _conn: PhantomData,
        });
        Ok((stmt, consumed))
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> i64 {
        // SAFETY: live handle.
        i64::from(unsafe { sys::sqlite3_changes(self.db) })
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: live handle.
        unsafe { sys::sqlite3_last_insert_rowid(self.db) }
    }

    /// Interrupts the running operation.
    pub fn interrupt(&self) {
        // SAFETY: live handle.
        unsafe { sys::sqlite3_interrupt(self.db) };
    }

    /// Returns a handle that can interrupt this connection from elsewhere.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            target: Arc::clone(&self.interrupt),
        }
    }

    /// Installs (`Some`) or clears (`None`) the busy callback. The policy is
    /// owned by this handle until it is replaced or the connection closes.
    pub fn set_busy_policy(&mut self, policy: Option<BusyPolicy>) -> DbResult<()> {
        let next = policy.map_or(ptr::null_mut(), |policy| Box::into_raw(Box::new(policy)));
        let handler: BusyFn = if next.is_null() {
            None
        } else {
            Some(busy_trampoline)
        };
        // SAFETY: live handle; `next` stays valid until it is replaced or the
        // connection is released.
        let rc = unsafe { sys::sqlite3_busy_handler(self.db, handler, next.cast::<c_void>()) };
        if rc != SQLITE_OK {
            // The engine kept the previous policy.
            free_busy_policy(next);
            return Err(DbError::new(rc, self.errmsg()));
        }
        free_busy_policy(std::mem::replace(&mut self.busy, next));
        Ok(())
    }

    /// Registers `record` under `name`. The engine holds its own reference to
    /// the record and drops it through `destroy_trampoline` when the function
    /// is replaced, the registration fails, or the connection closes.
    ///
    /// Returns the native result code.
    pub fn create_function(
        &self,
        name: &str,
        arity: c_int,
        record: &Rc<FunctionRecord>,
    ) -> DbResult<c_int> {
        let c_name = c_string(name, "function name")?;
        let user_data = Rc::into_raw(Rc::clone(record)).cast_mut().cast::<c_void>();
        let (x_func, x_step, x_final): (CallFn, CallFn, FinalFn) = if record.is_aggregate() {
            (None, Some(call_trampoline), Some(finalize_trampoline))
        } else {
            (Some(call_trampoline), None, None)
        };
        // SAFETY: live handle; `user_data` is released by `destroy_trampoline`
        // on every path, including failure.
        let rc = unsafe {
            sys::sqlite3_create_function_v2(
                self.db,
                c_name.as_ptr(),
                arity,
                sys::SQLITE_UTF8,
                user_data,
                x_func,
                x_step,
                x_final,
                Some(destroy_trampoline),
            )
        };
        Ok(rc)
    }

    /// Closes the connection. Further calls are no-ops.
    pub fn close(mut self) -> DbResult<()> {
        self.release()
    }

    fn release(&mut self) -> DbResult<()> {
        if self.db.is_null() {
            return Ok(());
        }
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0 = ptr::null_mut();
        let db = std::mem::replace(&mut self.db, ptr::null_mut());
        // SAFETY: `db` is open and, having been cleared above, closed only here.
        let rc = unsafe { sys::sqlite3_close_v2(db) };
        // The engine no longer calls the busy handler.
        free_busy_policy(std::mem::replace(&mut self.busy, ptr::null_mut()));
        if rc != SQLITE_OK {
            return Err(DbError::new(rc, errstr(rc)));
        }
        Ok(())
    }
}

/// Drops a policy previously leaked with `Box::into_raw`. Null is a no-op.
fn free_busy_policy(policy: *mut BusyPolicy) {
    if !policy.is_null() {
        // SAFETY: `policy` came from `Box::into_raw` and the engine no longer
        // references it.
        drop(unsafe { Box::from_raw(policy) });
    }
}

impl Drop for RawDb {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

// ── Statement handle ────────────────────────────────────────────────────

/// Owning wrapper around a `sqlite3_stmt*`, tied to its connection.
pub struct RawStmt<'conn> {
    stmt: NonNull<sys::sqlite3_stmt>,
    db: *mut sys::sqlite3,
    _conn: PhantomData<&'conn RawDb>,
}

impl RawStmt<'_> {
    fn col(idx: usize) -> c_int {
        c_int::try_from(idx).unwrap_or(c_int::MAX)
    }

    /// Runs `sqlite3_step` and returns the raw status.
    pub fn step(&self) -> c_int {
        // SAFETY: live statement.
        unsafe { sys::sqlite3_step(self.stmt.as_ptr()) }
    }

    /// Number of result columns.
    pub fn column_count(&self) -> usize {
        // SAFETY: live statement.
        usize::try_from(unsafe { sys::sqlite3_column_count(self.stmt.as_ptr()) }).unwrap_or(0)
    }

    /// Name of column `idx`.
    pub fn column_name(&self, idx: usize) -> String {
        // SAFETY: live statement; index below column_count.
        lossy(unsafe { sys::sqlite3_column_name(self.stmt.as_ptr(), Self::col(idx)) })
            .unwrap_or_default()
    }

    /// Declared type of column `idx`; `None` for expressions.
    pub fn column_decltype(&self, idx: usize) -> Option<String> {
        // SAFETY: live statement; index below column_count.
        lossy(unsafe { sys::sqlite3_column_decltype(self.stmt.as_ptr(), Self::col(idx)) })
    }

    /// Value of column `idx` in the current row as text; `None` for NULL.
    pub fn column_text(&self, idx: usize) -> Option<String> {
        let col = Self::col(idx);
        // SAFETY: live statement positioned on a row. The type is read before
        // the text so the NULL check sees the unconverted value.
        unsafe {
            if sys::sqlite3_column_type(self.stmt.as_ptr(), col) == sys::SQLITE_NULL {
                return None;
            }
            lossy(sys::sqlite3_column_text(self.stmt.as_ptr(), col).cast())
        }
    }

    /// Message of the most recent failure on the owning connection.
    pub fn errmsg(&self) -> String {
        errmsg(self.db)
    }

    /// Finalizes the statement.
    pub fn finalize(self) -> DbResult<()> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: the wrapper is consumed without running Drop, so this is the
        // only finalize for the handle.
        let rc = unsafe { sys::sqlite3_finalize(this.stmt.as_ptr()) };
        if rc != SQLITE_OK {
            return Err(DbError::new(rc, errmsg(this.db)));
        }
        Ok(())
    }
}

impl Drop for RawStmt<'_> {
    fn drop(&mut self) {
        // SAFETY: live statement, finalized only here or in `finalize`.
        unsafe { sys::sqlite3_finalize(self.stmt.as_ptr()) };
    }
}

// ── Function context ────────────────────────────────────────────────────

/// A `sqlite3_context*`, valid for one native callback invocation.
pub struct RawContext<'call> {
    ctx: NonNull<sys::sqlite3_context>,
    _call: PhantomData<&'call mut sys::sqlite3_context>,
}

impl RawContext<'_> {
    /// Sets a text result.
    pub fn set_text(&mut self, text: &str) {
        let Ok(len) = c_int::try_from(text.len()) else {
            // SAFETY: live context.
            unsafe { sys::sqlite3_result_error_toobig(self.ctx.as_ptr()) };
            return;
        };
        // SAFETY: live context; the engine copies the bytes (TRANSIENT).
        unsafe {
            sys::sqlite3_result_text(
                self.ctx.as_ptr(),
                text.as_ptr().cast(),
                len,
                sys::SQLITE_TRANSIENT(),
            );
        }
    }

    /// Sets an integer result.
    pub fn set_i64(&mut self, value: i64) {
        // SAFETY: live context.
        unsafe { sys::sqlite3_result_int64(self.ctx.as_ptr(), value) };
    }

    /// Sets a floating-point result.
    pub fn set_f64(&mut self, value: f64) {
        // SAFETY: live context.
        unsafe { sys::sqlite3_result_double(self.ctx.as_ptr(), value) };
    }

    /// Sets the result to an error carrying `message`.
    pub fn set_error(&mut self, message: &str) {
        let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
        // SAFETY: live context; the engine copies the message.
        unsafe { sys::sqlite3_result_error(self.ctx.as_ptr(), message.as_ptr().cast(), len) };
    }

    /// Sets the result to an out-of-memory error.
    pub fn set_error_nomem(&mut self) {
        // SAFETY: live context.
        unsafe { sys::sqlite3_result_error_nomem(self.ctx.as_ptr()) };
    }

    /// Returns the aggregate group slot. With `allocate` the slot is created
    /// (zeroed) on first use; otherwise `None` is returned if the group never
    /// allocated one.
    pub fn group_slot(&mut self, allocate: bool) -> Option<&mut usize> {
        let size = if allocate {
            c_int::try_from(std::mem::size_of::<usize>()).unwrap_or(0)
        } else {
            0
        };
        // SAFETY: live context of an aggregate; the engine owns the memory for
        // the lifetime of the group and zero-fills it on allocation.
        unsafe {
            sys::sqlite3_aggregate_context(self.ctx.as_ptr(), size)
                .cast::<usize>()
                .as_mut()
        }
    }
}

// ── Callback trampolines ────────────────────────────────────────────────

type CallFn = Option<
    unsafe extern "C" fn(*mut sys::sqlite3_context, c_int, *mut *mut sys::sqlite3_value),
>;
type FinalFn = Option<unsafe extern "C" fn(*mut sys::sqlite3_context)>;
type BusyFn = Option<unsafe extern "C" fn(*mut c_void, c_int) -> c_int>;

/// Recovers the record registered with `create_function`.
///
/// # Safety
///
/// `ctx` must be a live context of a function registered through
/// [`RawDb::create_function`].
unsafe fn record_of<'a>(
    ctx: *mut sys::sqlite3_context,
) -> Option<(&'a FunctionRecord, RawContext<'a>)> {
    let ctx = NonNull::new(ctx)?;
    let record = sys::sqlite3_user_data(ctx.as_ptr())
        .cast::<FunctionRecord>()
        .cast_const()
        .as_ref()?;
    Some((
        record,
        RawContext {
            ctx,
            _call: PhantomData,
        },
    ))
}

/// Reads one argument as text plus its storage class.
///
/// # Safety
///
/// `value` must be a live protected value of the current call.
unsafe fn read_argument(value: *mut sys::sqlite3_value) -> (Option<String>, StorageClass) {
    let class = StorageClass::from_code(sys::sqlite3_value_type(value));
    if class == StorageClass::Null {
        return (None, class);
    }
    (lossy(sys::sqlite3_value_text(value).cast()), class)
}

/// Entry point for scalar calls and aggregate steps.
unsafe extern "C" fn call_trampoline(
    ctx: *mut sys::sqlite3_context,
    argc: c_int,
    argv: *mut *mut sys::sqlite3_value,
) {
    let Some((record, raw)) = record_of(ctx) else {
        return;
    };
    let argc = usize::try_from(argc).unwrap_or(0);
    let values: &[*mut sys::sqlite3_value] = if argv.is_null() || argc == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(argv, argc)
    };
    let (args, classes): (Vec<Option<String>>, Vec<StorageClass>) =
        values.iter().map(|value| read_argument(*value)).unzip();
    record.call(raw, &args, &classes);
}

/// Entry point for aggregate finalization.
unsafe extern "C" fn finalize_trampoline(ctx: *mut sys::sqlite3_context) {
    if let Some((record, raw)) = record_of(ctx) {
        record.finish(raw);
    }
}

/// Releases the engine's reference to a function record.
unsafe extern "C" fn destroy_trampoline(user_data: *mut c_void) {
    if !user_data.is_null() {
        drop(Rc::from_raw(user_data.cast::<FunctionRecord>().cast_const()));
    }
}

/// Entry point for the busy handler.
unsafe extern "C" fn busy_trampoline(arg: *mut c_void, count: c_int) -> c_int {
    match arg.cast::<BusyPolicy>().as_mut() {
        Some(policy) => c_int::from(policy.on_busy(u32::try_from(count).unwrap_or(0))),
        None => 0,
    }
}
