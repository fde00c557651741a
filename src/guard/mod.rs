//! Candidate SQL Guard
//!
//! Agent output is untrusted text. Before a candidate reaches a database it
//! is unwrapped from Markdown code fences and checked here; anything refused
//! fails with `Rejected` and is never executed.
//!
//! # Validation Strategy
//! - Comments and quoted literals are blanked with the lexing rules of the
//!   target dialect before looking for `;` and for keywords
//! - Exactly one statement; a trailing `;` is tolerated and removed
//! - Statements that write data, change schema or change session state are
//!   refused by their leading keyword; `INTO` and data-modifying CTEs are refused
//! - Unrecognized leading words are left to the database, which reports the
//!   syntax error as an execution failure
//! - Text the guard cannot lex with certainty (MySQL executable comments) is refused

use crate::dialect::Dialect;
use crate::error::{QueryGateError, Result};

const FENCE: &str = "```";

/// Keywords that modify data or schema; forbidden anywhere inside a CTE or unrecognized statement
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT",
    "REVOKE",
];

/// Leading keywords of statements that are never executed
const UNSAFE_LEADING: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "RENAME", "GRANT", "REVOKE", "COMMENT", "COPY", "LOAD", "IMPORT", "CALL", "DO", "EXEC", "EXECUTE",
    "PREPARE", "DEALLOCATE", "SET", "RESET", "LOCK", "UNLOCK", "BEGIN", "START", "COMMIT", "ROLLBACK",
    "SAVEPOINT", "RELEASE", "END", "ABORT", "VACUUM", "ANALYZE", "REINDEX", "CLUSTER", "REFRESH",
    "CHECKPOINT", "DISCARD", "LISTEN", "NOTIFY", "UNLISTEN", "ATTACH", "DETACH", "USE", "HANDLER",
    "FLUSH", "KILL", "SHUTDOWN", "PURGE", "OPTIMIZE", "REPAIR", "INSTALL", "UNINSTALL", "XA",
    "SECURITY", "REASSIGN", "CACHE", "CLONE", "RESTART",
];

/// Leading keywords of read statements that may mention write keywords (`SHOW CREATE TABLE`)
const READ_LEADING: &[&str] = &["SELECT", "VALUES", "TABLE", "SHOW", "DESCRIBE", "DESC", "PRAGMA"];

/// PRAGMAs that only report, even when given an argument
const READ_PRAGMAS: &[&str] = &[
    "TABLE_INFO", "TABLE_XINFO", "TABLE_LIST", "INDEX_LIST", "INDEX_INFO", "INDEX_XINFO",
    "FOREIGN_KEY_LIST", "FOREIGN_KEY_CHECK", "INTEGRITY_CHECK", "QUICK_CHECK", "DATABASE_LIST",
    "COLLATION_LIST", "FUNCTION_LIST", "MODULE_LIST", "PRAGMA_LIST",
];

/// Unwrap, validate and normalize a candidate statement
///
/// Returns the statement text that should be executed (no fences, no
/// surrounding whitespace, no trailing `;`).
pub fn check_candidate(raw: &str, dialect: Dialect) -> Result<String> {
    let unfenced = strip_code_fences(raw);
    let statement = unfenced.trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if statement.is_empty() {
        return Err(QueryGateError::rejected("empty candidate"));
    }

    let code = strip_comments_and_literals(statement, dialect)?;

    if code.contains(';') {
        return Err(QueryGateError::rejected("multi-statement candidates are not executed"));
    }

    let words = keywords(&code);
    if words.is_empty() {
        return Err(QueryGateError::rejected("empty candidate"));
    }

    check_read_only(&words, &code, dialect)?;

    Ok(statement.to_string())
}

/// Extract the body of the first Markdown code fence, or the trimmed text if there is none
#[must_use]
pub fn strip_code_fences(raw: &str) -> &str {
    let Some(open) = raw.find(FENCE) else {
        return raw.trim();
    };

    let after = &raw[open + FENCE.len()..];
    let body = after.find(FENCE).map_or(after, |close| &after[..close]);

    // Drop an info string such as `sql` on the opening fence line
    let body = match body.split_once('\n') {
        Some((tag, rest)) if is_info_string(tag) => rest,
        _ => body,
    };

    body.trim()
}

fn is_info_string(line: &str) -> bool {
    line.trim().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Replace comments with whitespace and quoted literals/identifiers with `''`
///
/// Keeps statement structure (keywords, `;`) intact for the checks above.
fn strip_comments_and_literals(sql: &str, dialect: Dialect) -> Result<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut result = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match ch {
            '-' if next == Some('-') && opens_dash_comment(&chars, i, dialect) => {
                i = skip_line(&chars, i);
                result.push('\n');
            }
            '#' if dialect == Dialect::Mysql => {
                i = skip_line(&chars, i);
                result.push('\n');
            }
            '/' if next == Some('*') => {
                if dialect == Dialect::Mysql && is_executable_comment(&chars, i) {
                    return Err(QueryGateError::rejected(
                        "unsafe statement: MySQL executable comments are not executed",
                    ));
                }
                i = skip_block_comment(&chars, i);
                result.push(' ');
            }
            '\'' | '"' | '`' => {
                let backslash_escapes = match dialect {
                    Dialect::Mysql => ch != '`',
                    Dialect::Postgresql => ch == '\'' && is_escape_string(&chars, i),
                    Dialect::Sqlite | Dialect::Csv => false,
                };
                i = skip_quoted(&chars, i, backslash_escapes);
                result.push_str("''");
            }
            '$' if dialect == Dialect::Postgresql => match dollar_quote_end(&chars, i) {
                Some(end) => {
                    i = end;
                    result.push_str("''");
                }
                None => {
                    result.push(ch);
                    i += 1;
                }
            },
            _ => {
                result.push(ch);
                i += 1;
            }
        }
    }

    Ok(result)
}

/// MySQL needs whitespace after `--` for a comment (`1--1` is arithmetic)
fn opens_dash_comment(chars: &[char], start: usize, dialect: Dialect) -> bool {
    dialect != Dialect::Mysql
        || chars.get(start + 2).map_or(true, |c| c.is_whitespace() || c.is_control())
}

/// `/*! ... */` and `/*M! ... */` bodies are run by MySQL and MariaDB
fn is_executable_comment(chars: &[char], start: usize) -> bool {
    match chars.get(start + 2) {
        Some('!') => true,
        Some('M') => chars.get(start + 3) == Some(&'!'),
        _ => false,
    }
}

/// `E'...'` strings on PostgreSQL honor backslash escapes
fn is_escape_string(chars: &[char], quote: usize) -> bool {
    quote > 0
        && matches!(chars[quote - 1], 'E' | 'e')
        && (quote < 2 || !is_ident_char(chars[quote - 2]))
}

/// Index just past the end of the line comment starting at `start`
fn skip_line(chars: &[char], start: usize) -> usize {
    chars[start..].iter().position(|&c| c == '\n').map_or(chars.len(), |n| start + n + 1)
}

/// Index just past the `*/` closing the block comment at `start`
fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// Index just past the quote closing the literal at `start`; doubled quotes escape themselves
fn skip_quoted(chars: &[char], start: usize, backslash_escapes: bool) -> usize {
    let quote = chars[start];
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' if backslash_escapes => i += 2,
            c if c == quote => {
                if chars.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }

    chars.len()
}

/// End of a PostgreSQL `$tag$ ... $tag$` literal, or `None` if `$` does not open one
fn dollar_quote_end(chars: &[char], start: usize) -> Option<usize> {
    if start > 0 && is_ident_char(chars[start - 1]) {
        return None;
    }

    let mut j = start + 1;
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    if chars.get(j) != Some(&'$') || chars.get(start + 1).is_some_and(char::is_ascii_digit) {
        return None;
    }

    let tag = &chars[start..=j];
    let mut k = j + 1;
    while k + tag.len() <= chars.len() {
        if chars[k..k + tag.len()] == *tag {
            return Some(k + tag.len());
        }
        k += 1;
    }
    Some(chars.len())
}

/// Uppercased bare words of the statement, in order
fn keywords(code: &str) -> Vec<String> {
    code.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

/// Skip `EXPLAIN [ANALYZE] [VERBOSE]` / `EXPLAIN QUERY PLAN` so the explained statement is checked
fn strip_explain(words: &[String]) -> &[String] {
    let mut rest = words;
    if rest.first().is_some_and(|w| w == "EXPLAIN") {
        rest = &rest[1..];
        while rest
            .first()
            .is_some_and(|w| matches!(w.as_str(), "ANALYZE" | "VERBOSE" | "QUERY" | "PLAN" | "FORMAT"))
        {
            rest = &rest[1..];
        }
    }
    rest
}

fn check_read_only(words: &[String], code: &str, dialect: Dialect) -> Result<()> {
    let statement = strip_explain(words);
    let Some(first) = statement.first() else {
        return Ok(());
    };

    if UNSAFE_LEADING.contains(&first.as_str()) {
        return Err(QueryGateError::rejected(format!(
            "unsafe statement: '{first}' is not a read-only {dialect} statement"
        )));
    }

    // SELECT ... INTO creates a table on PostgreSQL, a file or variables on MySQL
    if statement.iter().any(|w| w == "INTO") {
        return Err(QueryGateError::rejected(format!(
            "unsafe statement: '{first} ... INTO' writes outside the result set"
        )));
    }

    // Data-modifying CTEs (`WITH d AS (DELETE ... RETURNING *) SELECT ...`)
    if !READ_LEADING.contains(&first.as_str()) {
        if let Some(write) = statement.iter().find(|w| WRITE_KEYWORDS.contains(&w.as_str())) {
            return Err(QueryGateError::rejected(format!(
                "unsafe statement: '{first}' statement contains '{write}'"
            )));
        }
    }

    if first == "PRAGMA" && matches!(dialect, Dialect::Sqlite | Dialect::Csv) {
        let reports = statement[1..].iter().take(2).any(|w| READ_PRAGMAS.contains(&w.as_str()));
        // PRAGMA assignments write database state
        if code.contains('=') || (code.contains('(') && !reports) {
            return Err(QueryGateError::rejected("unsafe statement: PRAGMA assignment"));
        }
    }

    Ok(())
}
