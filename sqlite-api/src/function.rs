//! Callback bridge for host-defined SQL functions and aggregates.
//!
//! The engine calls back through the trampolines in `ffi`, which recover the
//! [`FunctionRecord`] registered for the function and hand it the call's
//! context and arguments. The record runs the host closure inside a protected
//! region: an `Err` return or a panic is converted into a native error result
//! with a fixed diagnostic, and never unwinds into engine frames.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::error::{DbError, DbResult};
use super::ffi::{RawContext, SQLITE_ERROR, SQLITE_MISUSE};
use super::value::{AggregateState, StorageClass, Value};

/// Diagnostic set when a scalar function or an aggregate step fails.
pub const FUNCTION_FAILED: &str = "error occurred while processing function";

/// Diagnostic set when an aggregate finalizer fails.
pub const AGGREGATE_FINALIZE_FAILED: &str = "error occurred while processing aggregate finalize";

/// Closure invoked for a scalar call or an aggregate step.
pub type FunctionCallback = dyn Fn(&mut FunctionContext<'_>, &[Option<String>]) -> DbResult<()>;

/// Closure invoked once per aggregate group to produce its result.
pub type FinalizeCallback = dyn Fn(&mut FunctionContext<'_>) -> DbResult<()>;

/// Declared result type of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionType {
    /// Results are numbers: numeric text is stored as a number.
    Numeric,
    /// Results are text: numbers are stored as text.
    Text,
    /// Results keep whatever type they were given.
    #[default]
    Args,
    /// Results take the type of the argument at this position.
    Argument(usize),
}

impl FunctionType {
    /// Native code of [`FunctionType::Numeric`].
    pub const NUMERIC: i32 = -1;
    /// Native code of [`FunctionType::Text`].
    pub const TEXT: i32 = -2;
    /// Native code of [`FunctionType::Args`].
    pub const ARGS: i32 = -3;

    /// Parses a native type code. Non-negative codes name an argument.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            Self::NUMERIC => Some(Self::Numeric),
            Self::TEXT => Some(Self::Text),
            Self::ARGS => Some(Self::Args),
            n => usize::try_from(n).ok().map(Self::Argument),
        }
    }

    /// Native type code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Numeric => Self::NUMERIC,
            Self::Text => Self::TEXT,
            Self::Args => Self::ARGS,
            Self::Argument(n) => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }

    /// Resolves the coercion to apply for a call with the given arguments.
    fn target(self, classes: &[StorageClass]) -> Option<Self> {
        match self {
            Self::Numeric | Self::Text => Some(self),
            Self::Args => None,
            Self::Argument(n) => match classes.get(n)? {
                StorageClass::Integer | StorageClass::Float => Some(Self::Numeric),
                StorageClass::Text => Some(Self::Text),
                StorageClass::Blob | StorageClass::Null => None,
            },
        }
    }

    fn coerce(self, value: Value, classes: &[StorageClass]) -> Value {
        match (self.target(classes), value) {
            (Some(Self::Numeric), Value::Text(text)) => {
                numeric_value(&text).unwrap_or(Value::Text(text))
            }
            (Some(Self::Text), v @ (Value::Integer(_) | Value::Float(_))) => {
                Value::Text(v.to_string())
            }
            (_, v) => v,
        }
    }
}

/// Parses `text` as a decimal literal: optional sign, digits with an optional
/// fraction, optional exponent, surrounding whitespace allowed. Spellings such
/// as `nan` or `inf` and values that overflow to infinity are not numeric.
fn numeric_value(text: &str) -> Option<Value> {
    let literal = text.trim();
    let digits = literal.strip_prefix(['+', '-']).unwrap_or(literal);
    let (mantissa, exponent) = match digits.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => (mantissa, Some(exponent)),
        None => (digits, None),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return None;
    }
    if let Some(exponent) = exponent {
        let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
        if exponent.is_empty() || !all_digits(exponent) {
            return None;
        }
    }
    if exponent.is_none() && !mantissa.contains('.') {
        if let Ok(v) = literal.parse::<i64>() {
            return Some(Value::Integer(v));
        }
    }
    literal
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Value::Float)
}

/// Row count and lazily created state of one aggregate group.
#[derive(Debug, Default)]
pub struct AggregateGroup {
    rows: i64,
    state: Option<AggregateState>,
}

/// Handle to one native invocation of a registered function.
///
/// Only valid for the duration of the callback it was passed to.
pub struct FunctionContext<'call> {
    raw: RawContext<'call>,
    result_type: FunctionType,
    classes: &'call [StorageClass],
    group: Option<&'call mut AggregateGroup>,
}

impl<'call> FunctionContext<'call> {
    fn new(
        raw: RawContext<'call>,
        result_type: FunctionType,
        classes: &'call [StorageClass],
        group: Option<&'call mut AggregateGroup>,
    ) -> Self {
        Self {
            raw,
            result_type,
            classes,
            group,
        }
    }

    /// Sets the function's result. Only text, integers and floats are
    /// accepted; anything else fails before reaching the engine.
    ///
    /// The value is coerced according to the function's [`FunctionType`].
    /// Returns the value as given.
    pub fn set_result(&mut self, value: impl Into<Value>) -> DbResult<Value> {
        let value = value.into();
        if matches!(value, Value::Blob(_) | Value::Null) {
            return Err(DbError::BadResultType(value.type_name()));
        }
        match self.result_type.coerce(value.clone(), self.classes) {
            Value::Text(text) => self.raw.set_text(&text),
            Value::Integer(v) => self.raw.set_i64(v),
            Value::Float(v) => self.raw.set_f64(v),
            Value::Blob(_) | Value::Null => {}
        }
        Ok(value)
    }

    /// Sets the function's result to an error with `message`.
    pub fn set_result_error<'m>(&mut self, message: &'m str) -> &'m str {
        self.raw.set_error(message);
        message
    }

    /// Returns the state of the current aggregate group, creating it on first
    /// access within the group.
    pub fn aggregate_context(&mut self) -> DbResult<&mut AggregateState> {
        let group = self.group.as_deref_mut().ok_or_else(not_an_aggregate)?;
        Ok(group.state.get_or_insert_with(AggregateState::default))
    }

    /// Number of rows processed so far in the current group, including the
    /// current one.
    pub fn aggregate_count(&self) -> DbResult<i64> {
        self.group
            .as_deref()
            .map(|group| group.rows)
            .ok_or_else(not_an_aggregate)
    }

    /// Declared result type of the running function.
    #[must_use]
    pub const fn function_type(&self) -> FunctionType {
        self.result_type
    }
}

fn not_an_aggregate() -> DbError {
    DbError::new(SQLITE_MISUSE, "aggregate context requested by a scalar function")
}

enum Callbacks {
    Scalar(Box<FunctionCallback>),
    Aggregate {
        step: Box<FunctionCallback>,
        finalize: Box<FinalizeCallback>,
    },
}

#[derive(Default)]
struct GroupTable {
    last_id: usize,
    groups: HashMap<usize, AggregateGroup>,
}

impl GroupTable {
    fn allocate(&mut self) -> usize {
        self.last_id += 1;
        self.groups.insert(self.last_id, AggregateGroup::default());
        self.last_id
    }

    fn take(&mut self, id: usize) -> AggregateGroup {
        self.groups.remove(&id).unwrap_or_default()
    }

    fn put_back(&mut self, id: usize, group: AggregateGroup) {
        self.groups.insert(id, group);
    }
}

/// A registered function: its closures, declared result type and the state
/// of its in-flight aggregate groups. Shared between the connection's
/// registry and the engine, which keeps it alive as function user data.
pub struct FunctionRecord {
    name: String,
    arity: i32,
    callbacks: Callbacks,
    result_type: Cell<FunctionType>,
    groups: RefCell<GroupTable>,
}

impl FunctionRecord {
    fn new(name: &str, arity: i32, callbacks: Callbacks) -> Self {
        Self {
            name: name.to_string(),
            arity,
            callbacks,
            result_type: Cell::new(FunctionType::default()),
            groups: RefCell::new(GroupTable::default()),
        }
    }

    /// Creates the record of a scalar function.
    pub fn scalar(name: &str, arity: i32, function: Box<FunctionCallback>) -> Self {
        Self::new(name, arity, Callbacks::Scalar(function))
    }

    /// Creates the record of an aggregate function.
    pub fn aggregate(
        name: &str,
        arity: i32,
        step: Box<FunctionCallback>,
        finalize: Box<FinalizeCallback>,
    ) -> Self {
        Self::new(name, arity, Callbacks::Aggregate { step, finalize })
    }

    /// Returns `true` for aggregates.
    pub const fn is_aggregate(&self) -> bool {
        matches!(self.callbacks, Callbacks::Aggregate { .. })
    }

    /// Handles a scalar call or an aggregate step.
    pub fn call(&self, mut raw: RawContext<'_>, args: &[Option<String>], classes: &[StorageClass]) {
        let result_type = self.result_type.get();
        match &self.callbacks {
            Callbacks::Scalar(function) => {
                let mut ctx = FunctionContext::new(raw, result_type, classes, None);
                self.protect(&mut ctx, FUNCTION_FAILED, |ctx| function(ctx, args));
            }
            Callbacks::Aggregate { step, .. } => {
                let Some(slot) = raw.group_slot(true) else {
                    raw.set_error_nomem();
                    return;
                };
                if *slot == 0 {
                    *slot = self.groups.borrow_mut().allocate();
                }
                let id = *slot;
                let mut group = self.groups.borrow_mut().take(id);
                group.rows += 1;
                let mut ctx = FunctionContext::new(raw, result_type, classes, Some(&mut group));
                self.protect(&mut ctx, FUNCTION_FAILED, |ctx| step(ctx, args));
                drop(ctx);
                self.groups.borrow_mut().put_back(id, group);
            }
        }
    }

    /// Handles the end of an aggregate group and releases its state.
    pub fn finish(&self, mut raw: RawContext<'_>) {
        let Callbacks::Aggregate { finalize, .. } = &self.callbacks else {
            return;
        };
        let id = raw.group_slot(false).map_or(0, |slot| *slot);
        let mut group = self.groups.borrow_mut().take(id);
        let mut ctx = FunctionContext::new(raw, self.result_type.get(), &[], Some(&mut group));
        self.protect(&mut ctx, AGGREGATE_FINALIZE_FAILED, |ctx| finalize(ctx));
    }

    /// Runs `callback`, turning an error or a panic into a native error
    /// result carrying `diagnostic`.
    fn protect<'call, F>(
        &self,
        ctx: &mut FunctionContext<'call>,
        diagnostic: &'static str,
        callback: F,
    ) where
        F: FnOnce(&mut FunctionContext<'call>) -> DbResult<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(function = %self.signature(), error = %err, "{diagnostic}");
                ctx.raw.set_error(diagnostic);
            }
            Err(_) => {
                tracing::warn!(function = %self.signature(), "{diagnostic}: callback panicked");
                ctx.raw.set_error(diagnostic);
            }
        }
    }

    fn signature(&self) -> String {
        format!("{}({})", self.name, self.arity)
    }
}

/// Functions registered on one connection, keyed by name (ASCII case folded,
/// as the engine matches names) and arity.
#[derive(Default)]
pub struct FunctionRegistry {
    records: HashMap<(String, i32), Rc<FunctionRecord>>,
}

impl FunctionRegistry {
    /// Records a successful registration, replacing any previous function
    /// with the same name and arity.
    pub fn insert(&mut self, record: Rc<FunctionRecord>) {
        let key = (record.name.to_ascii_lowercase(), record.arity);
        self.records.insert(key, record);
    }

    /// Declares the result type of every function called `name`.
    pub fn set_function_type(&self, name: &str, result_type: FunctionType) -> DbResult<()> {
        let name_key = name.to_ascii_lowercase();
        let mut found = false;
        for ((registered, _), record) in &self.records {
            if *registered == name_key {
                record.result_type.set(result_type);
                found = true;
            }
        }
        if !found {
            return Err(DbError::new(
                SQLITE_ERROR,
                format!("function type {name}({})", result_type.code()),
            ));
        }
        Ok(())
    }
}
