use crate::{Error, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a table name that is interpolated into SQL text.
///
/// Accepts `name` or `schema.name`, where each part is an unquoted SQL
/// identifier of at most 63 bytes.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("table name cannot be empty".into()));
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(Error::Config(format!(
            "table name {name:?} has too many qualifiers"
        )));
    }

    for part in parts {
        if !is_plain_identifier(part) {
            return Err(Error::Config(format!(
                "table name {name:?} is not a plain SQL identifier"
            )));
        }
    }
    Ok(())
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
