// ABOUTME: Maps raw PostgreSQL failure messages onto a small error taxonomy
// ABOUTME: Severity decides whether a failure can halt the run on its own

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ConstraintViolation,
    ConnectionRefused,
    InvalidSyntax,
    Unknown,
}

impl ErrorCategory {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCategory::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCategory::InvalidSyntax => "INVALID_SYNTAX",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Error,
    /// Aborts the whole run even when `stop_on_first_error` is off.
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: &'static str,
}

impl Classification {
    fn new(category: ErrorCategory, severity: ErrorSeverity) -> Self {
        Self {
            category,
            severity,
            code: category.code(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

const CONSTRAINT_PHRASES: &[&str] = &[
    "violates foreign key constraint",
    "violates unique constraint",
    "violates check constraint",
    "violates not-null constraint",
    "violates exclusion constraint",
    "is not present in table",
    "is still referenced from table",
];

const ABORTED_TRANSACTION_PHRASES: &[&str] = &["current transaction is aborted"];

const CONNECTION_PHRASES: &[&str] = &[
    "could not connect",
    "connection refused",
    "connection reset",
];

const SYNTAX_PHRASES: &[&str] = &[
    "syntax error",
    "unterminated quoted string",
    "unterminated dollar-quoted string",
];

/// First matching rule wins; matching is case-insensitive.
pub fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();
    let mentions = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    if mentions(CONSTRAINT_PHRASES) {
        Classification::new(ErrorCategory::ConstraintViolation, ErrorSeverity::Error)
    } else if mentions(ABORTED_TRANSACTION_PHRASES) {
        // cascade of an earlier failure in the same transaction, not a root cause
        Classification::new(ErrorCategory::ConstraintViolation, ErrorSeverity::Warning)
    } else if mentions(CONNECTION_PHRASES) {
        Classification::new(ErrorCategory::ConnectionRefused, ErrorSeverity::Fatal)
    } else if mentions(SYNTAX_PHRASES) {
        Classification::new(ErrorCategory::InvalidSyntax, ErrorSeverity::Error)
    } else {
        Classification::new(ErrorCategory::Unknown, ErrorSeverity::Error)
    }
}

pub(crate) fn is_aborted_transaction(message: &str) -> bool {
    let lower = message.to_lowercase();
    ABORTED_TRANSACTION_PHRASES.iter().any(|p| lower.contains(p))
}

pub(crate) fn is_foreign_key_violation(message: &str) -> bool {
    message
        .to_lowercase()
        .contains("violates foreign key constraint")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_violation() {
        let c = classify(
            "insert or update on table \"child\" violates foreign key constraint \"child_parent_fkey\"",
        );
        assert_eq!(c.category, ErrorCategory::ConstraintViolation);
        assert_eq!(c.severity, ErrorSeverity::Error);
        assert_eq!(c.code, "CONSTRAINT_VIOLATION");
    }

    #[test]
    fn test_aborted_transaction_is_a_warning() {
        let c = classify("current transaction is aborted, commands ignored until end of transaction block");
        assert_eq!(c.category, ErrorCategory::ConstraintViolation);
        assert_eq!(c.severity, ErrorSeverity::Warning);
    }

    #[test]
    fn test_connection_refused_is_fatal() {
        let c = classify("could not connect to server: Connection refused");
        assert_eq!(c.category, ErrorCategory::ConnectionRefused);
        assert_eq!(c.severity, ErrorSeverity::Fatal);
        assert!(c.is_fatal());
    }

    #[test]
    fn test_syntax_and_unknown() {
        let c = classify("ERROR: SYNTAX ERROR at or near \"TABEL\"");
        assert_eq!(c.category, ErrorCategory::InvalidSyntax);
        assert_eq!(c.severity, ErrorSeverity::Error);

        let c = classify("permission denied for schema app");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.code, "UNKNOWN");
    }

    #[test]
    fn test_first_rule_wins() {
        // a constraint phrase beats the aborted-transaction phrase in the same message
        let c = classify(
            "current transaction is aborted after: duplicate key value violates unique constraint \"t_pkey\"",
        );
        assert_eq!(c.severity, ErrorSeverity::Error);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let messages = [
            "could not connect to server",
            "value too long for type character varying(10)",
            "",
        ];
        for message in messages {
            assert_eq!(classify(message), classify(message));
        }
    }

    #[test]
    fn test_helpers() {
        assert!(is_aborted_transaction("ERROR: Current transaction is aborted"));
        assert!(is_foreign_key_violation("violates FOREIGN KEY constraint \"x\""));
        assert!(!is_foreign_key_violation("violates unique constraint \"x\""));
    }
}
