//! Pre-persistence checks for schedule definitions.
//!
//! Everything here runs before a record is written; a failure aborts the save
//! and never surfaces later as a runtime error inside a populator tick.

use crate::error::ValidationError;
use crate::types::PeriodicTask;

impl PeriodicTask {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::Empty { field: "id" });
        }
        if self.task_type.trim().is_empty() {
            return Err(ValidationError::Empty { field: "task_type" });
        }
        if self.end_time.is_some() && self.max_number_of_executions.is_some() {
            return Err(ValidationError::ConflictingLimits {
                id: self.id.clone(),
            });
        }
        if self.max_number_of_executions == Some(0) {
            return Err(ValidationError::ZeroExecutions);
        }
        validate_cron_syntax(&self.cron_expression)
    }
}

/// Syntactic check of a 5- or 6-column cron expression.
///
/// Columns are separated by exactly one space; each column is `*` or a list of
/// numbers / ranges, optionally followed by `/step`.
pub fn validate_cron_syntax(expression: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    if expression.trim() != expression {
        return Err(invalid("leading or trailing whitespace".into()));
    }
    let columns: Vec<&str> = expression.split(' ').collect();
    if columns.len() != expression.split_whitespace().count() {
        return Err(invalid("use a single space as column separator".into()));
    }
    if !matches!(columns.len(), 5 | 6) {
        return Err(invalid(format!(
            "expected 5 or 6 columns, got {}",
            columns.len()
        )));
    }
    for (i, column) in columns.iter().enumerate() {
        if !column_is_valid(column) {
            return Err(invalid(format!("bad value '{column}' in column {}", i + 1)));
        }
    }
    Ok(())
}

fn column_is_valid(column: &str) -> bool {
    let (base, step) = match column.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (column, None),
    };
    if let Some(step) = step {
        if !is_number(step) {
            return false;
        }
    }
    base == "*"
        || base.split(',').all(|item| match item.split_once('-') {
            Some((lo, hi)) => is_number(lo) && is_number(hi),
            None => is_number(item),
        })
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
