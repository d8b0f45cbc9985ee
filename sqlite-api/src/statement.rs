//! Safe wrapper around a `SQLite` prepared statement.
//!
//! This file contains **no `unsafe` code**. All FFI interaction is delegated to
//! [`ffi::RawStmt`] which encapsulates the raw pointers and C type conversions.

use std::mem;
use std::rc::Rc;

use super::error::{DbError, DbResult, ErrorKind, Handle};
use super::ffi::{self, RawStmt};

/// Outcome of a single [`Statement::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// The current row, one entry per column (`None` for NULL). `None` once
    /// the statement is done.
    pub row: Option<Vec<Option<String>>>,
    /// Column names. Shared by every result of the same statement.
    pub columns: Rc<[String]>,
    /// Declared column types, `None` where the engine has none (expressions).
    pub types: Rc<[Option<String>]>,
}

impl StepResult {
    /// Returns `true` if a row is available.
    #[must_use]
    pub const fn is_row(&self) -> bool {
        self.row.is_some()
    }

    /// Returns `true` once the statement has run to completion.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.row.is_none()
    }
}

enum Vm<'conn> {
    Live(RawStmt<'conn>),
    /// The compiled text held no statement.
    Empty,
    Finalized,
}

/// A compiled `SQLite` statement.
///
/// Created via [`Connection::compile`](super::Connection::compile).
/// Tied to the lifetime of the connection that created it.
/// Finalized explicitly, after a failing step, or when dropped.
pub struct Statement<'conn> {
    vm: Vm<'conn>,
    columns: Option<Rc<[String]>>,
    types: Option<Rc<[Option<String>]>>,
}

impl<'conn> Statement<'conn> {
    /// Wraps a raw statement handle; `None` for text without a statement.
    pub(super) fn new(raw: Option<RawStmt<'conn>>) -> Self {
        Self {
            vm: raw.map_or(Vm::Empty, Vm::Live),
            columns: None,
            types: None,
        }
    }

    /// Executes the statement until the next row is available or it is done.
    ///
    /// Column names and types are read on the first row (or on completion)
    /// and reused for every later call. A busy database fails with the
    /// `Busy` kind and leaves the statement usable; any other failure
    /// finalizes it.
    pub fn step(&mut self) -> DbResult<StepResult> {
        let raw = match &self.vm {
            Vm::Live(raw) => raw,
            Vm::Empty => {
                let columns = Rc::clone(self.columns.get_or_insert_with(|| Rc::from([])));
                let types = Rc::clone(self.types.get_or_insert_with(|| Rc::from([])));
                return Ok(StepResult {
                    row: None,
                    columns,
                    types,
                });
            }
            Vm::Finalized => return Err(DbError::ClosedHandle(Handle::Statement)),
        };

        let rc = raw.step();
        match rc {
            ffi::SQLITE_ROW | ffi::SQLITE_DONE => {
                let (columns, types) = metadata(raw, &mut self.columns, &mut self.types);
                let row = (rc == ffi::SQLITE_ROW)
                    .then(|| (0..columns.len()).map(|idx| raw.column_text(idx)).collect());
                Ok(StepResult { row, columns, types })
            }
            ffi::SQLITE_BUSY => Err(DbError::new(rc, format!("busy in step: {}", raw.errmsg()))),
            rc if ErrorKind::is_known_failure(rc) => {
                let message = raw.errmsg();
                if let Vm::Live(raw) = mem::replace(&mut self.vm, Vm::Finalized) {
                    // The failure is reported below; finalize repeats it.
                    let _ = raw.finalize();
                }
                tracing::debug!(
                    code = rc,
                    error = %message,
                    "statement finalized after failed step"
                );
                Err(DbError::new(rc, message))
            }
            rc => {
                tracing::error!(code = rc, "unknown result from step");
                Err(DbError::UnknownStepResult(rc))
            }
        }
    }

    /// Releases the compiled statement.
    ///
    /// Fails with [`DbError::ClosedHandle`] if it was already finalized,
    /// explicitly or by a failing step.
    pub fn finalize(&mut self) -> DbResult<()> {
        match mem::replace(&mut self.vm, Vm::Finalized) {
            Vm::Live(raw) => raw.finalize(),
            Vm::Empty => Ok(()),
            Vm::Finalized => Err(DbError::ClosedHandle(Handle::Statement)),
        }
    }

    /// Returns `true` once the statement has been finalized.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.vm, Vm::Finalized)
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("finalized", &self.is_finalized())
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// Returns the cached column metadata, reading it from `raw` on first use.
fn metadata(
    raw: &RawStmt<'_>,
    columns: &mut Option<Rc<[String]>>,
    types: &mut Option<Rc<[Option<String>]>>,
) -> (Rc<[String]>, Rc<[Option<String>]>) {
    let count = raw.column_count();
    let columns =
        columns.get_or_insert_with(|| (0..count).map(|idx| raw.column_name(idx)).collect());
    let types =
        types.get_or_insert_with(|| (0..count).map(|idx| raw.column_decltype(idx)).collect());
    (Rc::clone(columns), Rc::clone(types))
}
