use crate::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Process-wide default for whether expression evaluation is enabled.
/// Set once at initialization.
static EVAL_ENABLED_DEFAULT: AtomicBool = AtomicBool::new(true);

/// Change the process-wide expression-evaluation default.
pub fn set_eval_enabled_default(on: bool) {
    EVAL_ENABLED_DEFAULT.store(on, AtomicOrdering::Relaxed);
}

///
pub fn eval_enabled_default() -> bool {
    EVAL_ENABLED_DEFAULT.load(AtomicOrdering::Relaxed)
}

/// A user-defined function callable from expressions.
pub trait EvalFunction {
    ///
    fn name(&self) -> &str;
    ///
    fn call(&self, args: &[Value]) -> Result<Value>;
}

/// Date/time formatting options forwarded to the evaluator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemporalConfig {
    ///
    pub date_format: Option<String>,
    ///
    pub time_format: Option<String>,
    ///
    pub date_time_format: Option<String>,
}

/// Number formatting options forwarded to the evaluator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NumericConfig {
    ///
    pub decimal_digits: Option<u8>,
    ///
    pub grouping: bool,
}

/// Configuration held by the database and forwarded to the evaluator
/// verbatim; the core does not interpret it.
#[derive(Clone, Default)]
pub struct EvalConfig {
    ///
    pub temporal: TemporalConfig,
    ///
    pub numeric: NumericConfig,
    /// Lookup for user-defined functions referenced from expressions.
    pub function_lookup: Option<Rc<dyn Fn(&str) -> Option<Rc<dyn EvalFunction>>>>,
    /// Opaque key-value bag.
    pub bindings: BTreeMap<String, String>,
}

/// External expression evaluator: default values, calculated columns and
/// validation rules. The core exposes the hooks; the evaluator is a
/// pluggable collaborator.
pub trait ExprEvaluator {
    /// Value for a column with a default-value expression, invoked when
    /// the inserted row's value is null.
    fn evaluate_default(
        &self,
        db: &DB,
        table: &Table,
        column: &Column,
        row: &[Value],
    ) -> Result<Value>;

    /// Value for a calculated column, invoked at insert and update.
    fn evaluate_calculated(
        &self,
        db: &DB,
        table: &Table,
        column: &Column,
        row: &[Value],
    ) -> Result<Value>;

    /// Check a column validation rule. Failures surface to the caller as
    /// constraint violations.
    fn validate_column(&self, db: &DB, table: &Table, column: &Column, row: &[Value])
        -> Result<()>;

    /// Check the table's row validation rule, invoked once per row after
    /// the column validators pass.
    fn validate_row(&self, db: &DB, table: &Table, row: &[Value]) -> Result<()>;

    /// Resolve a user-defined function referenced from an expression.
    fn lookup_function(&self, name: &str) -> Option<Rc<dyn EvalFunction>> {
        let _ = name;
        None
    }
}
