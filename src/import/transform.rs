// ABOUTME: Statement rewrites applied while planning or submitting an import
// ABOUTME: ON CONFLICT handling for inserts, ownership-sensitive filtering and deferred-constraint wrapping

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::reorder::table_ref;
use crate::error::{ImporterError, Result};
use crate::remote::ExecuteDetails;

static PRIMARY_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?(?:"?(\w+)"?\s*\.\s*)?"?(\w+)"?\s+ADD\s+CONSTRAINT\s+"?\w+"?\s+PRIMARY\s+KEY\s*\(([^)]*)\)"#,
    )
    .expect("primary key pattern is valid")
});

static INSERT_COLUMNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*INSERT\s+INTO\s+(?:"?\w+"?\s*\.\s*)?"?\w+"?\s*\(([^)]*)\)\s*(?:VALUES|SELECT|OVERRIDING)\b"#,
    )
    .expect("insert columns pattern is valid")
});

static INSERT_INTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*INSERT\s+INTO\b").expect("insert pattern is valid"));

static ON_CONFLICT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bON\s+CONFLICT\b").expect("on conflict pattern is valid"));

/// Statements that only succeed for the owner of the object (or a superuser).
static OWNERSHIP_SENSITIVE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)^\s*ALTER\s+.*\bOWNER\s+TO\b",
        r"(?is)^\s*COMMENT\s+ON\s+TABLE\b",
        r"(?is)^\s*GRANT\b",
        r"(?is)^\s*REVOKE\b",
        r"(?is)^\s*ALTER\s+TABLE\b.*\b(?:ENABLE|DISABLE)\s+ROW\s+LEVEL\s+SECURITY\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("ownership pattern is valid"))
    .collect()
});

const DEFER_PROLOGUE: [&str; 2] = [
    "SET CONSTRAINTS ALL DEFERRED;",
    "SET LOCAL session_replication_role = replica;",
];
const DEFER_EPILOGUE: [&str; 2] = [
    "SET CONSTRAINTS ALL IMMEDIATE;",
    "SET LOCAL session_replication_role = origin;",
];

/// What to do when an inserted row collides with an existing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Leave inserts untouched; collisions fail the statement.
    #[default]
    Error,
    /// `ON CONFLICT DO NOTHING`.
    Skip,
    /// `ON CONFLICT (<primary key>) DO UPDATE` for inserts with a column list.
    Update,
}

impl ConflictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictMode::Error => "error",
            ConflictMode::Skip => "skip",
            ConflictMode::Update => "update",
        }
    }
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictMode {
    type Err = ImporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(ConflictMode::Error),
            "skip" => Ok(ConflictMode::Skip),
            "update" => Ok(ConflictMode::Update),
            other => Err(ImporterError::InvalidOptions(format!(
                "unknown conflict mode '{}', expected error, skip or update",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictRewrite {
    pub rewritten: usize,
    /// Inserts left untouched in `update` mode: no primary key known or no column list.
    pub unresolved: usize,
}

fn unquote(identifier: &str) -> String {
    identifier.trim().trim_matches('"').to_lowercase()
}

/// Primary-key columns per table (`schema.table`, lowercase) declared by constraint statements.
pub fn primary_keys(constraint_statements: &[String]) -> HashMap<String, Vec<String>> {
    constraint_statements
        .iter()
        .filter_map(|statement| {
            let caps = PRIMARY_KEY.captures(statement)?;
            let table = table_ref(caps.get(1).map(|m| m.as_str()), caps.get(2)?.as_str());
            let columns = caps.get(3)?.as_str().split(',').map(unquote).collect();
            Some((table, columns))
        })
        .collect()
}

fn with_clause(statement: &str, clause: &str) -> String {
    let body = statement.trim_end().trim_end_matches(';').trim_end();
    format!("{} {};", body, clause)
}

fn update_clause(statement: &str, keys: &HashMap<String, Vec<String>>) -> Option<String> {
    let table = super::reorder::insert_target(statement)?;
    let key = keys.get(&table)?;
    let columns = INSERT_COLUMNS.captures(statement)?.get(1)?.as_str();

    let assignments: Vec<String> = columns
        .split(',')
        .map(str::trim)
        .filter(|c| !key.contains(&unquote(c)))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let target = key.join(", ");
    Some(if assignments.is_empty() {
        format!("ON CONFLICT ({}) DO NOTHING", target)
    } else {
        format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            target,
            assignments.join(", ")
        )
    })
}

/// Appends an `ON CONFLICT` clause to every insert that does not already carry one.
pub fn rewrite_on_conflict(
    statements: &mut [String],
    mode: ConflictMode,
    keys: &HashMap<String, Vec<String>>,
) -> ConflictRewrite {
    let mut outcome = ConflictRewrite::default();
    if mode == ConflictMode::Error {
        return outcome;
    }

    for statement in statements.iter_mut() {
        if !INSERT_INTO.is_match(statement) || ON_CONFLICT.is_match(statement) {
            continue;
        }
        let clause = match mode {
            ConflictMode::Skip => Some("ON CONFLICT DO NOTHING".to_string()),
            ConflictMode::Update => update_clause(statement, keys),
            ConflictMode::Error => None,
        };
        match clause {
            Some(clause) => {
                *statement = with_clause(statement, &clause);
                outcome.rewritten += 1;
            }
            None => outcome.unresolved += 1,
        }
    }
    outcome
}

pub fn is_ownership_sensitive(statement: &str) -> bool {
    OWNERSHIP_SENSITIVE.iter().any(|re| re.is_match(statement))
}

/// Splits ownership-sensitive statements out of `statements`, returning them in order.
pub fn take_ownership_sensitive(statements: &mut Vec<String>) -> Vec<String> {
    let (removed, kept): (Vec<String>, Vec<String>) = std::mem::take(statements)
        .into_iter()
        .partition(|s| is_ownership_sensitive(s));
    *statements = kept;
    removed
}

/// Surrounds a data batch with statements that defer constraint checks and triggers
/// for the duration of the batch transaction.
pub fn wrap_deferred(batch: &[String]) -> Vec<String> {
    DEFER_PROLOGUE
        .iter()
        .map(|s| s.to_string())
        .chain(batch.iter().cloned())
        .chain(DEFER_EPILOGUE.iter().map(|s| s.to_string()))
        .collect()
}

/// Maps proxy details for a wrapped batch back onto the original `batch_len` statements.
/// Failures of the wrapper statements are attributed to the first (or last) statement.
pub fn unwrap_deferred(mut details: ExecuteDetails, batch_len: usize) -> ExecuteDetails {
    let wrappers = DEFER_PROLOGUE.len() + DEFER_EPILOGUE.len();
    let last = batch_len.saturating_sub(1);
    let mut wrapper_failures = 0;

    for failure in &mut details.errors {
        match failure.index.checked_sub(DEFER_PROLOGUE.len()) {
            Some(index) if index < batch_len => failure.index = index,
            Some(_) => {
                wrapper_failures += 1;
                failure.index = last;
            }
            None => {
                wrapper_failures += 1;
                failure.index = 0;
            }
        }
    }

    let wrappers_ok = wrappers.saturating_sub(wrapper_failures);
    details.executed = details.executed.saturating_sub(wrappers_ok).min(batch_len);
    details.failed = details
        .failed
        .saturating_sub(wrapper_failures)
        .max(usize::from(wrapper_failures > 0))
        .min(batch_len - details.executed);
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StatementFailure;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn keys() -> HashMap<String, Vec<String>> {
        primary_keys(&strings(&[
            r#"ALTER TABLE ONLY public.customers ADD CONSTRAINT customers_pkey PRIMARY KEY (id);"#,
            r#"ALTER TABLE ONLY "public"."order_lines" ADD CONSTRAINT order_lines_pkey PRIMARY KEY ("order_id", line_no);"#,
            "ALTER TABLE ONLY public.orders ADD CONSTRAINT orders_fk FOREIGN KEY (customer_id) REFERENCES public.customers(id);",
        ]))
    }

    #[test]
    fn test_primary_keys_parsed() {
        let keys = keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["public.customers"], vec!["id"]);
        assert_eq!(keys["public.order_lines"], vec!["order_id", "line_no"]);
    }

    #[test]
    fn test_skip_appends_do_nothing() {
        let mut statements = strings(&[
            "INSERT INTO public.customers VALUES (1, 'a');",
            "INSERT INTO customers VALUES (2) ON CONFLICT DO NOTHING;",
            "CREATE INDEX i ON customers (id);",
        ]);
        let outcome = rewrite_on_conflict(&mut statements, ConflictMode::Skip, &HashMap::new());
        assert_eq!(outcome.rewritten, 1);
        assert_eq!(
            statements[0],
            "INSERT INTO public.customers VALUES (1, 'a') ON CONFLICT DO NOTHING;"
        );
        assert_eq!(
            statements[1],
            "INSERT INTO customers VALUES (2) ON CONFLICT DO NOTHING;"
        );
    }

    #[test]
    fn test_update_uses_primary_key_and_column_list() {
        let mut statements = strings(&[
            "INSERT INTO public.customers (id, name, email) VALUES (1, 'a', 'x@y');",
            "INSERT INTO public.order_lines (\"order_id\", line_no) VALUES (1, 1);",
            "INSERT INTO public.customers VALUES (2, 'b', 'z@y');",
            "INSERT INTO public.unknown (id) VALUES (1);",
        ]);
        let outcome = rewrite_on_conflict(&mut statements, ConflictMode::Update, &keys());
        assert_eq!(outcome.rewritten, 2);
        assert_eq!(outcome.unresolved, 2);
        assert_eq!(
            statements[0],
            "INSERT INTO public.customers (id, name, email) VALUES (1, 'a', 'x@y') ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email;"
        );
        assert!(statements[1].ends_with("ON CONFLICT (order_id, line_no) DO NOTHING;"));
        assert!(!statements[2].contains("ON CONFLICT"));
    }

    #[test]
    fn test_error_mode_leaves_inserts_alone() {
        let mut statements = strings(&["INSERT INTO t VALUES (1);"]);
        let outcome = rewrite_on_conflict(&mut statements, ConflictMode::Error, &keys());
        assert_eq!(outcome, ConflictRewrite::default());
        assert_eq!(statements[0], "INSERT INTO t VALUES (1);");
    }

    #[test]
    fn test_ownership_sensitive_statements_split_out() {
        let mut statements = strings(&[
            "CREATE TABLE public.t (id int);",
            "ALTER TABLE public.t OWNER TO postgres;",
            "ALTER SEQUENCE public.t_id_seq OWNER TO postgres;",
            "GRANT SELECT ON public.t TO anon;",
            "REVOKE ALL ON SCHEMA public FROM PUBLIC;",
            "COMMENT ON TABLE public.t IS 'grant access later';",
            "ALTER TABLE public.t ENABLE ROW LEVEL SECURITY;",
            "INSERT INTO public.t VALUES (1, 'GRANT ALL');",
        ]);
        let removed = take_ownership_sensitive(&mut statements);
        assert_eq!(removed.len(), 6);
        assert_eq!(
            statements,
            strings(&[
                "CREATE TABLE public.t (id int);",
                "INSERT INTO public.t VALUES (1, 'GRANT ALL');"
            ])
        );
    }

    #[test]
    fn test_deferred_wrapping_round_trip_counts() {
        let batch = strings(&["INSERT INTO a VALUES (1);", "INSERT INTO a VALUES (2);"]);
        let wrapped = wrap_deferred(&batch);
        assert_eq!(wrapped.len(), 6);
        assert_eq!(wrapped[0], "SET CONSTRAINTS ALL DEFERRED;");
        assert_eq!(wrapped[2], batch[0]);

        let details = ExecuteDetails {
            executed: 5,
            failed: 1,
            errors: vec![StatementFailure {
                index: 3,
                statement: batch[1].clone(),
                error: "duplicate key value violates unique constraint".to_string(),
            }],
            duration: None,
        };
        let mapped = unwrap_deferred(details, batch.len());
        assert_eq!(mapped.executed, 1);
        assert_eq!(mapped.failed, 1);
        assert_eq!(mapped.errors[0].index, 1);
    }

    #[test]
    fn test_deferred_prologue_failure_maps_to_first_statement() {
        let details = ExecuteDetails {
            executed: 0,
            failed: 1,
            errors: vec![StatementFailure {
                index: 1,
                statement: DEFER_PROLOGUE[1].to_string(),
                error: "permission denied to set parameter \"session_replication_role\""
                    .to_string(),
            }],
            duration: None,
        };
        let mapped = unwrap_deferred(details, 3);
        assert_eq!(mapped.executed, 0);
        assert_eq!(mapped.failed, 1);
        assert_eq!(mapped.errors[0].index, 0);
    }
}
