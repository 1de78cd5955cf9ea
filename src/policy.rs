//! Additive-only migration policy.
//!
//! Migrations must not destroy data. [`lint_sql`] scans the forward
//! section of a migration (everything before `-- rollback:`; the rollback
//! section is expected to be destructive) and reports:
//!
//! | Rule | Severity |
//! |------|----------|
//! | `DROP TABLE`, `DROP COLUMN`, `TRUNCATE` | failure |
//! | `DELETE FROM t` without `WHERE` | failure |
//! | `ALTER COLUMN .. TYPE varchar/char` | failure |
//! | `ALTER COLUMN .. TYPE t(n)` or a narrowed integer type, without `USING` | failure |
//! | `ALTER COLUMN .. DROP NOT NULL` / `DROP DEFAULT` | warning |
//! | `DROP INDEX` | warning |
//! | `DROP CONSTRAINT` not re-added within 10 lines | warning |
//!
//! `DROP CONSTRAINT IF EXISTS x` followed by `ADD CONSTRAINT x` is the
//! sanctioned way to change a constraint and is not reported. SQL comments
//! are ignored.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::migrate::extract_forward_sql;

/// Lines searched after a `DROP CONSTRAINT` for the matching `ADD CONSTRAINT`.
const CONSTRAINT_PAIR_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Failure,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub rule: &'static str,
    pub message: String,
    /// 1-based line in the migration file.
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LintReport {
    pub path: PathBuf,
    pub findings: Vec<Finding>,
}

impl LintReport {
    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Failure)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn passed(&self) -> bool {
        self.failures().next().is_none()
    }
}

macro_rules! policy_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

// Prefix shared by the ALTER COLUMN rules.
macro_rules! alter_column {
    ($tail:literal) => {
        concat!(r"(?i)\balter\s+table\s+[\w.]+\s+alter\s+column\s+\w+\s+", $tail)
    };
}

policy_pattern!(RE_DROP_TABLE, r"(?i)\bdrop\s+table\b");
policy_pattern!(RE_DROP_COLUMN, r"(?i)\bdrop\s+column\b");
policy_pattern!(RE_TRUNCATE, r"(?i)\btruncate\b");
policy_pattern!(RE_DELETE_FROM, r"(?i)\bdelete\s+from\s+[\w.]+");
policy_pattern!(RE_TYPE_VARCHAR, alter_column!(r"type\s+varchar"));
policy_pattern!(RE_TYPE_CHAR, alter_column!(r"type\s+char"));
policy_pattern!(RE_TYPE_LENGTH, alter_column!(r"type\s+\w+\(\d+\)"));
policy_pattern!(RE_TYPE_NARROW_INT, alter_column!(r"type\s+(?:tinyint|smallint|integer)\b"));
policy_pattern!(RE_DROP_NOT_NULL, alter_column!(r"drop\s+not\s+null"));
policy_pattern!(RE_DROP_DEFAULT, alter_column!(r"drop\s+default"));
policy_pattern!(RE_DROP_INDEX, r"(?i)\bdrop\s+index\b");
policy_pattern!(RE_DROP_CONSTRAINT, r"(?i)\bdrop\s+constraint\s+(if\s+exists\s+)?(\w+)");
policy_pattern!(RE_ADD_CONSTRAINT, r"(?i)\badd\s+constraint\s+(\w+)");

// Suffix exemptions, matched against the text right after a rule match.
policy_pattern!(RE_FOLLOWED_BY_USING, r"(?i)^\s+using\b");
policy_pattern!(RE_FOLLOWED_BY_WHERE, r"(?i)^\s+where\b");

struct Rule {
    name: &'static str,
    severity: Severity,
    pattern: &'static LazyLock<Option<Regex>>,
    /// The match is exempt when the remaining text matches this.
    unless_followed_by: Option<&'static LazyLock<Option<Regex>>>,
    message: &'static str,
}

static RULES: &[Rule] = &[
    Rule {
        name: "drop_table",
        severity: Severity::Failure,
        pattern: &RE_DROP_TABLE,
        unless_followed_by: None,
        message: "DROP TABLE detected (destructive)",
    },
    Rule {
        name: "drop_column",
        severity: Severity::Failure,
        pattern: &RE_DROP_COLUMN,
        unless_followed_by: None,
        message: "DROP COLUMN detected (destructive)",
    },
    Rule {
        name: "alter_type_varchar",
        severity: Severity::Failure,
        pattern: &RE_TYPE_VARCHAR,
        unless_followed_by: None,
        message: "ALTER COLUMN ... TYPE varchar detected (type narrowing, destructive)",
    },
    Rule {
        name: "alter_type_char",
        severity: Severity::Failure,
        pattern: &RE_TYPE_CHAR,
        unless_followed_by: None,
        message: "ALTER COLUMN ... TYPE char detected (type narrowing, destructive)",
    },
    Rule {
        name: "alter_type_length",
        severity: Severity::Failure,
        pattern: &RE_TYPE_LENGTH,
        unless_followed_by: Some(&RE_FOLLOWED_BY_USING),
        message: "ALTER COLUMN TYPE with length specification (potentially destructive, add USING if needed)",
    },
    Rule {
        name: "truncate",
        severity: Severity::Failure,
        pattern: &RE_TRUNCATE,
        unless_followed_by: None,
        message: "TRUNCATE detected (destructive)",
    },
    Rule {
        name: "delete_without_where",
        severity: Severity::Failure,
        pattern: &RE_DELETE_FROM,
        unless_followed_by: Some(&RE_FOLLOWED_BY_WHERE),
        message: "DELETE FROM without WHERE clause (destructive)",
    },
    Rule {
        name: "alter_type_narrow_int",
        severity: Severity::Failure,
        pattern: &RE_TYPE_NARROW_INT,
        unless_followed_by: Some(&RE_FOLLOWED_BY_USING),
        message: "ALTER COLUMN TYPE with narrowed numeric type (destructive)",
    },
    Rule {
        name: "drop_not_null",
        severity: Severity::Warning,
        pattern: &RE_DROP_NOT_NULL,
        unless_followed_by: None,
        message: "ALTER COLUMN ... DROP NOT NULL (removing constraint)",
    },
    Rule {
        name: "drop_default",
        severity: Severity::Warning,
        pattern: &RE_DROP_DEFAULT,
        unless_followed_by: None,
        message: "ALTER COLUMN ... DROP DEFAULT (removing constraint)",
    },
    Rule {
        name: "drop_index",
        severity: Severity::Warning,
        pattern: &RE_DROP_INDEX,
        unless_followed_by: None,
        message: "DROP INDEX detected (check query plans)",
    },
];

/// Blank out `--` comments, keeping byte offsets and line breaks intact.
/// A `--` inside a quoted literal or identifier is not a comment.
fn strip_comments(sql: &str) -> String {
    let mut out = sql.as_bytes().to_vec();
    let mut quote: Option<u8> = None;
    let mut in_comment = false;
    let mut i = 0;
    while i < out.len() {
        let b = out[i];
        if in_comment {
            if b == b'\n' {
                in_comment = false;
            } else {
                out[i] = b' ';
            }
        } else if let Some(q) = quote {
            // A doubled quote closes and reopens, which lands in the same state.
            if b == q {
                quote = None;
            }
        } else if b == b'\'' || b == b'"' {
            quote = Some(b);
        } else if b == b'-' && out.get(i + 1) == Some(&b'-') {
            in_comment = true;
            out[i] = b' ';
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

/// Policy findings for a migration's full text, ordered by line.
pub fn lint_sql(sql: &str) -> Vec<Finding> {
    let forward = strip_comments(extract_forward_sql(sql));
    let mut findings = Vec::new();

    for rule in RULES {
        let Some(re) = &**rule.pattern else {
            continue;
        };
        for m in re.find_iter(&forward) {
            let exempt = rule
                .unless_followed_by
                .and_then(|exempt| (**exempt).as_ref())
                .is_some_and(|exempt| exempt.is_match(&forward[m.end()..]));
            if !exempt {
                findings.push(Finding {
                    severity: rule.severity,
                    rule: rule.name,
                    message: rule.message.to_string(),
                    line: line_of(&forward, m.start()),
                });
            }
        }
    }

    findings.extend(unpaired_constraint_drops(&forward));
    findings.sort_by_key(|f| (f.line, f.severity == Severity::Warning));
    findings
}

fn unpaired_constraint_drops(forward: &str) -> Vec<Finding> {
    let (Some(drop_re), Some(add_re)) = (&*RE_DROP_CONSTRAINT, &*RE_ADD_CONSTRAINT)
    else {
        return Vec::new();
    };
    let lines: Vec<&str> = forward.lines().collect();
    let mut findings = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        for caps in drop_re.captures_iter(line) {
            let if_exists = caps.get(1).is_some();
            let name = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
            let window_end = (i + CONSTRAINT_PAIR_WINDOW).min(lines.len());
            let re_added = lines[i..window_end].iter().any(|candidate| {
                add_re.captures_iter(candidate).any(|add| {
                    add.get(1).map(|m| m.as_str().to_ascii_lowercase()) == name
                })
            });
            if !(if_exists && re_added) {
                findings.push(Finding {
                    severity: Severity::Warning,
                    rule: "drop_constraint",
                    message: format!(
                        "DROP CONSTRAINT {} without IF EXISTS + matching ADD CONSTRAINT",
                        name.as_deref().unwrap_or("?")
                    ),
                    line: i + 1,
                });
            }
        }
    }
    findings
}

pub fn lint_file(path: &Path) -> Result<LintReport> {
    let sql = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(LintReport {
        path: path.to_path_buf(),
        findings: lint_sql(&sql),
    })
}

/// Lint every `*.sql` file directly inside `dir`, sorted by file name.
pub fn lint_dir(dir: &Path) -> Result<Vec<LintReport>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    paths.sort();
    paths.iter().map(|p| lint_file(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(sql: &str) -> Vec<&'static str> {
        lint_sql(sql).into_iter().map(|f| f.rule).collect()
    }

    #[test]
    fn test_additive_migration_is_clean() {
        let sql = "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT);\n\
                   ALTER TABLE notes ADD COLUMN tag_id INTEGER;\n\
                   CREATE INDEX idx_notes_tag ON notes(tag_id);\n";
        assert!(lint_sql(sql).is_empty());
    }

    #[test]
    fn test_rollback_section_is_ignored() {
        let sql = "CREATE TABLE tags (id INTEGER);\n-- rollback:\nDROP TABLE tags;\n";
        assert!(lint_sql(sql).is_empty());
    }

    #[test]
    fn test_destructive_statements() {
        assert_eq!(rules("DROP TABLE notes;"), vec!["drop_table"]);
        assert_eq!(rules("alter table notes drop column body;"), vec!["drop_column"]);
        assert_eq!(rules("TRUNCATE notes;"), vec!["truncate"]);
    }

    #[test]
    fn test_delete_requires_where() {
        assert_eq!(rules("DELETE FROM notes;"), vec!["delete_without_where"]);
        assert!(rules("DELETE FROM notes WHERE id = 3;").is_empty());
        assert!(rules("delete from public.notes\n  where archived = 1;").is_empty());
    }

    #[test]
    fn test_type_changes() {
        assert!(rules("ALTER TABLE notes ALTER COLUMN title TYPE varchar(80);")
            .contains(&"alter_type_varchar"));
        assert_eq!(
            rules("ALTER TABLE notes ALTER COLUMN n TYPE smallint;"),
            vec!["alter_type_narrow_int"]
        );
        assert!(rules("ALTER TABLE notes ALTER COLUMN n TYPE integer USING n::integer;").is_empty());
        assert!(rules("ALTER TABLE notes ALTER COLUMN n TYPE bigint;").is_empty());
        assert_eq!(
            rules("ALTER TABLE notes ALTER COLUMN n TYPE numeric(10);"),
            vec!["alter_type_length"]
        );
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let report = LintReport {
            path: PathBuf::from("005_relax.sql"),
            findings: lint_sql(
                "ALTER TABLE notes ALTER COLUMN title DROP NOT NULL;\nDROP INDEX idx_old;",
            ),
        };
        assert!(report.passed());
        assert_eq!(report.warnings().count(), 2);
    }

    #[test]
    fn test_constraint_swap_is_allowed() {
        let sql = "ALTER TABLE notes DROP CONSTRAINT IF EXISTS notes_kind_check;\n\
                   ALTER TABLE notes ADD CONSTRAINT notes_kind_check CHECK (kind IN ('a', 'b', 'c'));\n";
        assert!(lint_sql(sql).is_empty());
    }

    #[test]
    fn test_unpaired_constraint_drop_warns() {
        let findings = lint_sql("ALTER TABLE notes DROP CONSTRAINT notes_kind_check;\n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].rule, "drop_constraint");
    }

    #[test]
    fn test_comments_are_ignored_and_lines_reported() {
        let sql = "-- we never drop table notes\nCREATE TABLE a (id INTEGER);\nTRUNCATE a;\n";
        let findings = lint_sql(sql);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, 3);
    }

    #[test]
    fn test_dashes_inside_literal_are_not_a_comment() {
        let sql = "ALTER TABLE notes ADD COLUMN sep TEXT DEFAULT 'a--b'; DROP TABLE notes;\n";
        assert_eq!(rules(sql), vec!["drop_table"]);

        let sql = "ALTER TABLE notes ADD COLUMN who TEXT DEFAULT 'it''s'; -- drop table later\n";
        assert!(lint_sql(sql).is_empty());
    }
}
