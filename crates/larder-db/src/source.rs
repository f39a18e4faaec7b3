//! Building migration definitions from SQL text and `*.sql` files.

use std::path::Path;

use larder_common::{Error, MigrationDefinition, Result};
use tracing::{debug, warn};

/// Load every `*.sql` file in `dir` as one definition, ordered by file name.
///
/// The identifier is the file stem, so `2024-01-01_schema.sql` becomes
/// `2024-01-01_schema`.
pub fn load_dir(dir: &Path) -> Result<Vec<MigrationDefinition>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!(
            "migrations directory {}",
            dir.display()
        )));
    }

    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut definitions = Vec::new();
    for entry in entries {
        let path = entry.path();
        let is_sql = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
        if !is_sql || !path.is_file() {
            continue;
        }

        let Some(identifier) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!("skipping migration file with non UTF-8 name: {}", path.display());
            continue;
        };

        let sql = std::fs::read_to_string(&path)?;
        let statements = split_statements(&sql);
        if statements.is_empty() {
            warn!("migration file {} contains no statements", path.display());
        }
        debug!(
            identifier,
            statements = statements.len(),
            "loaded migration file"
        );
        definitions.push(MigrationDefinition::new(identifier, statements));
    }

    Ok(definitions)
}

/// Split a script into statements on top-level `;`.
///
/// Semicolons inside string literals (including `E'...'` escape strings),
/// quoted identifiers, comments and dollar-quoted bodies (`$$ ... $$`,
/// `$fn$ ... $fn$`) do not split.
/// Fragments made only of whitespace and comments are dropped. Statement
/// text is otherwise kept as written, minus surrounding whitespace and the
/// terminating semicolon.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                has_code = true;
                let backslash_escapes = quote == b'\'' && opens_escape_string(bytes, i);
                i = skip_quoted(bytes, i, quote, backslash_escapes);
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = skip_line_comment(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
                continue;
            }
            b'$' => {
                if let Some(end) = skip_dollar_quoted(sql, i) {
                    has_code = true;
                    i = end;
                    continue;
                }
                has_code = true;
            }
            b';' => {
                if has_code {
                    statements.push(sql[start..i].trim().to_string());
                }
                start = i + 1;
                has_code = false;
            }
            b if !b.is_ascii_whitespace() => has_code = true,
            _ => {}
        }
        i += 1;
    }

    if has_code {
        statements.push(sql[start..].trim().to_string());
    }
    statements
}

/// Whether the quote at `open` is prefixed by a standalone `E` or `e`.
fn opens_escape_string(bytes: &[u8], open: usize) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80;
    match open.checked_sub(1).map(|p| bytes[p]) {
        Some(b'E' | b'e') => open < 2 || !is_word(bytes[open - 2]),
        _ => false,
    }
}

/// Index just past the closing quote. Doubled quotes are escapes, and so is
/// any backslash pair when `backslash_escapes` is set.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut j = open + 1;
    while j < bytes.len() {
        if backslash_escapes && bytes[j] == b'\\' {
            j += 2;
            continue;
        }
        if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], open: usize) -> usize {
    bytes[open..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |pos| open + pos + 1)
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    let mut j = open;
    while j < bytes.len() {
        if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'*') {
            depth += 1;
            j += 2;
        } else if bytes[j] == b'*' && bytes.get(j + 1) == Some(&b'/') {
            depth -= 1;
            j += 2;
            if depth == 0 {
                return j;
            }
        } else {
            j += 1;
        }
    }
    bytes.len()
}

/// If a dollar-quote tag opens at `open`, the index just past its closing
/// tag (or the end of input when unterminated). `None` for `$1` parameters
/// and `$` inside identifiers.
fn skip_dollar_quoted(sql: &str, open: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    if open > 0 && (is_ident(bytes[open - 1]) || bytes[open - 1] == b'$') {
        return None;
    }
    if bytes.get(open + 1).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut j = open + 1;
    while j < bytes.len() && is_ident(bytes[j]) {
        j += 1;
    }
    if bytes.get(j) != Some(&b'$') {
        return None;
    }

    let tag = &sql[open..=j];
    let body_start = j + 1;
    Some(
        sql[body_start..]
            .find(tag)
            .map_or(bytes.len(), |pos| body_start + pos + tag.len()),
    )
}
