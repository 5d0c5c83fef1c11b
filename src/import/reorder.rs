// ABOUTME: Foreign-key aware ordering of data statements
// ABOUTME: Ranks tables topologically so parent rows are inserted before child rows

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

static INSERT_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*INSERT\s+INTO\s+(?:"?(\w+)"?\s*\.\s*)?"?(\w+)"?"#)
        .expect("insert target pattern is valid")
});

static FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?(?:"?(\w+)"?\s*\.\s*)?"?(\w+)"?.*?FOREIGN\s+KEY\s*\([^)]*\)\s*REFERENCES\s+(?:ONLY\s+)?(?:"?(\w+)"?\s*\.\s*)?"?(\w+)"?"#,
    )
    .expect("foreign key pattern is valid")
});

const DEFAULT_SCHEMA: &str = "public";

pub(crate) fn table_ref(schema: Option<&str>, table: &str) -> String {
    format!(
        "{}.{}",
        schema.unwrap_or(DEFAULT_SCHEMA).to_lowercase(),
        table.to_lowercase()
    )
}

/// Target table of an `INSERT INTO`, as lowercase `schema.table`.
pub fn insert_target(statement: &str) -> Option<String> {
    let caps = INSERT_TARGET.captures(statement)?;
    let table = caps.get(2)?.as_str();
    Some(table_ref(caps.get(1).map(|m| m.as_str()), table))
}

/// Every `(child, parent)` foreign-key edge declared by a constraint statement.
pub fn foreign_key_edges(statement: &str) -> Vec<(String, String)> {
    FOREIGN_KEY
        .captures_iter(statement)
        .filter_map(|caps| {
            let child = caps.get(2)?.as_str();
            let parent = caps.get(4)?.as_str();
            Some((
                table_ref(caps.get(1).map(|m| m.as_str()), child),
                table_ref(caps.get(3).map(|m| m.as_str()), parent),
            ))
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorderReport {
    /// Foreign keys found in the constraint statements.
    pub fk_edges: usize,
    /// Edges between two tables that both have data statements.
    pub applied_edges: usize,
    /// `child -> parent` edges where one side has no data statements.
    pub missing_table_edges: Vec<String>,
    /// Tables caught in (or downstream of) a dependency cycle, left in original order.
    pub unresolved_tables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorderOutcome {
    pub statements: Vec<String>,
    pub report: ReorderReport,
}

/// Reorders data statements so referenced tables are populated first.
pub fn reorder(data_statements: &[String], constraint_statements: &[String]) -> Vec<String> {
    reorder_with_report(data_statements, constraint_statements).statements
}

pub fn reorder_with_report(
    data_statements: &[String],
    constraint_statements: &[String],
) -> ReorderOutcome {
    // tables in order of first appearance
    let mut tables: Vec<String> = Vec::new();
    let mut table_index: HashMap<String, usize> = HashMap::new();
    let targets: Vec<Option<usize>> = data_statements
        .iter()
        .map(|statement| {
            insert_target(statement).map(|table| {
                *table_index.entry(table.clone()).or_insert_with(|| {
                    tables.push(table);
                    tables.len() - 1
                })
            })
        })
        .collect();

    let mut report = ReorderReport::default();
    let mut parents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); tables.len()];
    let mut missing = BTreeSet::new();

    for statement in constraint_statements {
        for (child, parent) in foreign_key_edges(statement) {
            report.fk_edges += 1;
            if child == parent {
                continue;
            }
            match (table_index.get(&child), table_index.get(&parent)) {
                (Some(&c), Some(&p)) => {
                    if parents[c].insert(p) {
                        report.applied_edges += 1;
                    }
                }
                _ => {
                    missing.insert(format!("{} -> {}", child, parent));
                }
            }
        }
    }
    report.missing_table_edges = missing.into_iter().collect();

    if report.applied_edges == 0 {
        return ReorderOutcome {
            statements: data_statements.to_vec(),
            report,
        };
    }

    let ranks = rank_tables(&parents);
    let fallback_rank = ranks.iter().flatten().max().map_or(0, |r| r + 1);
    report.unresolved_tables = tables
        .iter()
        .zip(&ranks)
        .filter(|(_, rank)| rank.is_none())
        .map(|(table, _)| table.clone())
        .collect();

    let mut keyed: Vec<(usize, &String)> = data_statements
        .iter()
        .zip(&targets)
        .map(|(statement, target)| {
            let rank = match target {
                Some(t) => ranks[*t].unwrap_or(fallback_rank),
                None => usize::MAX,
            };
            (rank, statement)
        })
        .collect();
    // stable: equal ranks keep their original relative order
    keyed.sort_by_key(|(rank, _)| *rank);

    ReorderOutcome {
        statements: keyed.into_iter().map(|(_, s)| s.clone()).collect(),
        report,
    }
}

/// Kahn's algorithm by layers. A table's rank is one past its highest-ranked parent;
/// tables that never become free (cycles and their descendants) get `None`.
fn rank_tables(parents: &[BTreeSet<usize>]) -> Vec<Option<usize>> {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); parents.len()];
    let mut indegree: Vec<usize> = parents.iter().map(|p| p.len()).collect();
    for (child, ps) in parents.iter().enumerate() {
        for &parent in ps {
            children[parent].push(child);
        }
    }

    let mut ranks = vec![None; parents.len()];
    let mut layer: Vec<usize> = (0..parents.len()).filter(|&t| indegree[t] == 0).collect();
    let mut rank = 0;

    while !layer.is_empty() {
        let mut next = Vec::new();
        for &table in &layer {
            ranks[table] = Some(rank);
            for &child in &children[table] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    next.push(child);
                }
            }
        }
        layer = next;
        rank += 1;
    }

    ranks
}
