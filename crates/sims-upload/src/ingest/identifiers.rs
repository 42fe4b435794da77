//! SQL identifier handling
//!
//! Business column names come straight from spreadsheet headers and may hold
//! any text, so they are always double-quoted. Table names come from
//! configuration and must be plain identifiers.

use std::collections::HashSet;

use crate::error::{IngestError, IngestResult};

/// PostgreSQL truncates identifiers beyond this many bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Quote an identifier for interpolation into SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `table` or `schema.table`, each part `[A-Za-z_][A-Za-z0-9_]*`
pub fn validate_table_name(name: &str) -> IngestResult<&str> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && part.len() <= MAX_IDENTIFIER_LEN
        });

    if valid {
        Ok(name)
    } else {
        Err(IngestError::InvalidIdentifier(format!("'{name}' is not a valid table name")))
    }
}

/// Validated and quoted table reference, e.g. `"public"."timetable"`
pub fn qualified_table(name: &str) -> IngestResult<String> {
    let name = validate_table_name(name)?;
    Ok(name.split('.').map(quote_ident).collect::<Vec<_>>().join("."))
}

/// Longest prefix of `name` within [`MAX_IDENTIFIER_LEN`] bytes, on a char boundary
pub fn truncate_identifier(name: &str) -> &str {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let mut end = MAX_IDENTIFIER_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Validate a business column name taken from a header
pub fn validate_column_name(name: &str) -> IngestResult<&str> {
    if name.trim().is_empty() || name.len() > MAX_IDENTIFIER_LEN || name.contains('\0') {
        return Err(IngestError::InvalidIdentifier(format!(
            "'{name}' cannot be used as a column name"
        )));
    }
    Ok(name)
}

/// Lowercase snake_case identifier suggested for a header
///
/// Characters outside `[0-9a-z_]` become `_`, runs of `_` collapse, a leading
/// digit gets a `_` prefix. Headers with nothing usable give `None`.
pub fn sanitize_identifier(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;

    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' };
        if mapped == '_' {
            if !last_underscore {
                out.push('_');
            }
            last_underscore = true;
        } else {
            out.push(mapped);
            last_underscore = false;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return None;
    }

    let mut ident = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    };
    ident.truncate(MAX_IDENTIFIER_LEN);
    Some(ident)
}

/// Hands out identifiers that are unique within one table
#[derive(Debug, Default)]
pub struct IdentifierSet {
    taken: HashSet<String>,
}

impl IdentifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `base`, or `base_2`, `base_3`, ... if already taken
    ///
    /// Bases longer than [`MAX_IDENTIFIER_LEN`] bytes are truncated first.
    pub fn claim(&mut self, base: &str) -> String {
        let base = truncate_identifier(base);
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }

        let mut n = 2;
        loop {
            let suffix = format!("_{n}");
            let mut head = base.to_string();
            while head.len() + suffix.len() > MAX_IDENTIFIER_LEN {
                head.pop();
            }
            let candidate = format!("{head}{suffix}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("日期"), "\"日期\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("timetable_staging").is_ok());
        assert!(validate_table_name("sims.timetable").is_ok());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("x; drop").is_err());
        assert_eq!(qualified_table("sims.t").unwrap(), "\"sims\".\"t\"");
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Teacher Name").as_deref(), Some("teacher_name"));
        assert_eq!(sanitize_identifier("  Hours (per week) ").as_deref(), Some("hours_per_week"));
        assert_eq!(sanitize_identifier("2024 Term").as_deref(), Some("_2024_term"));
        assert_eq!(sanitize_identifier("日期"), None);
        assert_eq!(sanitize_identifier(&"x".repeat(100)).unwrap().len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_identifier_set_suffixes() {
        let mut set = IdentifierSet::new();
        assert_eq!(set.claim("name"), "name");
        assert_eq!(set.claim("name"), "name_2");
        assert_eq!(set.claim("name"), "name_3");

        let long = "y".repeat(MAX_IDENTIFIER_LEN);
        set.claim(&long);
        let second = set.claim(&long);
        assert!(second.ends_with("_2"));
        assert_eq!(second.len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_long_headers_are_truncated_on_char_boundaries() {
        let header = "学生の保護者連絡先電話番号（自宅または携帯）を記入してください";
        assert!(header.len() > MAX_IDENTIFIER_LEN);

        let mut set = IdentifierSet::new();
        let first = set.claim(header);
        let second = set.claim(header);

        assert!(first.len() <= MAX_IDENTIFIER_LEN);
        assert!(header.starts_with(&first));
        assert!(validate_column_name(&first).is_ok());
        assert!(second.ends_with("_2"));
        assert!(second.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(first, second);
    }
}
