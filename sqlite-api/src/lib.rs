//! Safe Rust bridge over the `SQLite` C interface.
//!
//! This crate lets host code open a database, compile and step SQL
//! statements, register Rust closures as SQL functions, aggregates and busy
//! handlers, and receive native result codes as a typed error taxonomy.
//!
//! The engine is the `SQLite` amalgamation bundled by `libsqlite3-sys`. The
//! `ffi` module is the **only** file that contains `unsafe` code or C types;
//! everything else works with the safe types defined here.
//!
//! Closures registered with a [`Connection`] run on the thread that steps the
//! statement. An `Err` or a panic inside them never unwinds into the engine:
//! the call fails with a fixed diagnostic instead, which surfaces through the
//! next [`Statement::step`].

mod ffi;

mod busy;
mod connection;
pub mod error;
mod function;
mod statement;
pub mod value;

pub use busy::BusyCallback;
pub use connection::{Connection, OpenFlags};
pub use error::{DbError, DbResult, ErrorKind, Handle};
pub use ffi::InterruptHandle;
pub use function::{FunctionContext, FunctionType, AGGREGATE_FINALIZE_FAILED, FUNCTION_FAILED};
pub use statement::{Statement, StepResult};
pub use value::{AggregateState, StorageClass, Value};

/// Text encoding used for every string crossing the bridge.
pub const ENCODING: &str = "UTF-8";

/// Version of the linked `SQLite` library, e.g. `"3.45.0"`.
#[must_use]
pub fn version() -> String {
    ffi::libversion()
}

/// Returns `true` if `sql` ends with at least one complete statement.
#[must_use]
pub fn complete(sql: &str) -> bool {
    ffi::complete(sql)
}

#[cfg(test)]
mod tests;
