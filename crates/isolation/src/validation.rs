//! Identifier validation and sanitization.
//!
//! SQL identifiers (schema, database and table names) cannot be supplied as
//! bound parameters, so every string that ends up spliced into DDL passes
//! through this module immediately before use. Anything accepted by an
//! `assert_safe_*` function or produced by [`sanitize_identifier`] is safe to
//! place inside a quoted SQL identifier.
//!
//! | Function | Accepts |
//! |----------|---------|
//! | [`validate_tenant_identifier`] | `^[a-z][a-z0-9-]{1,61}[a-z0-9]$` |
//! | [`validate_schema_name`] | `^[a-z_][a-z0-9_]{0,62}$` |
//! | [`validate_database_name`] | same as schema names |
//!
//! Inputs longer than [`MAX_INPUT_BYTES`] are rejected before any pattern
//! match runs.
//!
//! # Examples
//!
//! ```
//! use tenantry_isolation::validation::{sanitize_identifier, validate_schema_name};
//!
//! assert!(validate_schema_name("tenant_acme_corp"));
//! assert!(!validate_schema_name("tenant; DROP TABLE x"));
//! assert_eq!(sanitize_identifier("Acme-Corp!"), "acme_corp");
//! assert_eq!(sanitize_identifier("42"), "t_42");
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::error::IdentifierError;

/// Hard cap on untrusted input length, checked before pattern matching.
pub const MAX_INPUT_BYTES: usize = 512;

/// Maximum identifier length accepted by the strictest supported engine.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Placeholder returned by [`sanitize_identifier`] when nothing usable remains.
pub const SANITIZE_FALLBACK: &str = "tenant";

static TENANT_IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9\-]{1,61}[a-z0-9]$").expect("tenant identifier pattern is valid")
});

static SQL_IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Returns `true` if `identifier` is a well-formed tenant slug.
///
/// Slugs are 3 to 63 characters of lowercase letters, digits and hyphens,
/// starting with a letter and not ending with a hyphen.
pub fn validate_tenant_identifier(identifier: &str) -> bool {
    if identifier.is_empty() || identifier.len() > MAX_INPUT_BYTES {
        return false;
    }
    TENANT_IDENTIFIER_RE.is_match(identifier)
}

/// Returns `true` if `name` is safe to use as a schema name.
pub fn validate_schema_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_INPUT_BYTES {
        return false;
    }
    SQL_IDENTIFIER_RE.is_match(name)
}

/// Returns `true` if `name` is safe to use as a database name.
pub fn validate_database_name(name: &str) -> bool {
    validate_schema_name(name)
}

/// Fails with [`IdentifierError::InvalidTenantIdentifier`] unless the slug is valid.
pub fn assert_safe_tenant_identifier(identifier: &str, context: &str) -> Result<(), IdentifierError> {
    if validate_tenant_identifier(identifier) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidTenantIdentifier {
            value: truncate_for_report(identifier),
            context: context.to_string(),
        })
    }
}

/// Fails with [`IdentifierError::InvalidSchemaName`] unless the name is safe.
pub fn assert_safe_schema_name(name: &str, context: &str) -> Result<(), IdentifierError> {
    if validate_schema_name(name) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidSchemaName {
            value: truncate_for_report(name),
            context: context.to_string(),
        })
    }
}

/// Fails with [`IdentifierError::InvalidDatabaseName`] unless the name is safe.
pub fn assert_safe_database_name(name: &str, context: &str) -> Result<(), IdentifierError> {
    if validate_database_name(name) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidDatabaseName {
            value: truncate_for_report(name),
            context: context.to_string(),
        })
    }
}

/// Fails with [`IdentifierError::InvalidTableName`] unless the name is safe.
pub fn assert_safe_table_name(name: &str, context: &str) -> Result<(), IdentifierError> {
    if validate_schema_name(name) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidTableName {
            value: truncate_for_report(name),
            context: context.to_string(),
        })
    }
}

/// Fails with [`IdentifierError::InvalidColumnName`] unless the name is safe.
pub fn assert_safe_column_name(name: &str, context: &str) -> Result<(), IdentifierError> {
    if validate_schema_name(name) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidColumnName {
            value: truncate_for_report(name),
            context: context.to_string(),
        })
    }
}

/// Turns an arbitrary string into a valid SQL identifier.
///
/// Lowercases, maps hyphens and every other disallowed character to `_`,
/// collapses runs of underscores, trims leading and trailing underscores,
/// prefixes a leading digit with `t_`, truncates to 63 bytes and falls back
/// to `"tenant"` if nothing is left. The result always satisfies
/// [`validate_schema_name`], and the function is idempotent.
pub fn sanitize_identifier(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len().min(MAX_INPUT_BYTES));
    let mut last_underscore = false;
    for ch in identifier.chars().flat_map(char::to_lowercase) {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() { ch } else { '_' };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('_');
    let mut sanitized = match trimmed.chars().next() {
        None => SANITIZE_FALLBACK.to_string(),
        Some(first) if first.is_ascii_lowercase() => trimmed.to_string(),
        Some(_) => format!("t_{trimmed}"),
    };

    // Everything is ASCII by now, so byte truncation is char-safe.
    sanitized.truncate(MAX_IDENTIFIER_BYTES);
    let kept = sanitized.trim_end_matches('_').len();
    sanitized.truncate(kept);
    sanitized
}

/// Quotes an already-validated identifier for the given dialect.
///
/// Callers must validate `name` first; quoting is not an escaping mechanism.
pub fn quote_identifier(dialect: crate::dialect::Dialect, name: &str) -> String {
    use crate::dialect::Dialect;
    match dialect {
        Dialect::MySql => format!("`{name}`"),
        Dialect::SqlServer => format!("[{name}]"),
        Dialect::Postgres | Dialect::Sqlite | Dialect::Unknown => format!("\"{name}\""),
    }
}

fn truncate_for_report(value: &str) -> String {
    const REPORT_LIMIT: usize = 80;
    if value.len() <= REPORT_LIMIT {
        return value.to_string();
    }
    let mut end = REPORT_LIMIT;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_identifier_rules() {
        assert!(validate_tenant_identifier("acme-corp"));
        assert!(validate_tenant_identifier("abc"));
        assert!(validate_tenant_identifier("t1-2"));
        assert!(!validate_tenant_identifier("ab"));
        assert!(!validate_tenant_identifier("-acme"));
        assert!(!validate_tenant_identifier("acme-"));
        assert!(!validate_tenant_identifier("1acme"));
        assert!(!validate_tenant_identifier("Acme"));
        assert!(!validate_tenant_identifier("acme_corp"));
        assert!(!validate_tenant_identifier(&"a".repeat(64)));
        assert!(validate_tenant_identifier(&"a".repeat(63)));
    }

    #[test]
    fn test_schema_name_rules() {
        assert!(validate_schema_name("tenant_acme"));
        assert!(validate_schema_name("_private"));
        assert!(validate_schema_name("a"));
        assert!(!validate_schema_name(""));
        assert!(!validate_schema_name("9lives"));
        assert!(!validate_schema_name("Tenant"));
        assert!(!validate_schema_name("tenant-acme"));
        assert!(!validate_schema_name("tenant\n"));
        assert!(!validate_schema_name(&"a".repeat(64)));
        assert!(validate_schema_name(&"a".repeat(63)));
    }

    #[test]
    fn test_length_cap_checked_first() {
        let huge = "a".repeat(MAX_INPUT_BYTES + 1);
        assert!(!validate_schema_name(&huge));
        assert!(!validate_tenant_identifier(&huge));
    }

    #[test]
    fn test_assert_reports_context() {
        let err = assert_safe_schema_name("x;y", "initialize tenant=t1").unwrap_err();
        assert!(matches!(err, IdentifierError::InvalidSchemaName { .. }));
        assert!(err.to_string().contains("initialize tenant=t1"));

        let err = assert_safe_database_name("db name", "").unwrap_err();
        assert!(matches!(err, IdentifierError::InvalidDatabaseName { .. }));
    }

    #[test]
    fn test_report_value_is_truncated() {
        let err = assert_safe_schema_name(&"x".repeat(400), "").unwrap_err();
        assert!(err.value().len() < 100);
        assert!(err.value().ends_with("..."));
    }

    #[test]
    fn test_sanitize_examples() {
        assert_eq!(sanitize_identifier("acme-corp"), "acme_corp");
        assert_eq!(sanitize_identifier("My.Company"), "my_company");
        assert_eq!(sanitize_identifier("--a--b--"), "a_b");
        assert_eq!(sanitize_identifier("123abc"), "t_123abc");
        assert_eq!(sanitize_identifier("_9"), "t_9");
        assert_eq!(sanitize_identifier(""), "tenant");
        assert_eq!(sanitize_identifier("!!!"), "tenant");
        assert_eq!(sanitize_identifier("'; DROP TABLE x --"), "drop_table_x");
    }

    #[test]
    fn test_sanitize_truncates_without_trailing_underscore() {
        let input = format!("{}-tail", "a".repeat(62));
        let out = sanitize_identifier(&input);
        assert!(out.len() <= MAX_IDENTIFIER_BYTES);
        assert!(!out.ends_with('_'));
        assert!(validate_schema_name(&out));
    }

    #[test]
    fn test_sanitize_non_ascii() {
        let out = sanitize_identifier("Zürich-Büro");
        assert!(validate_schema_name(&out));
        assert_eq!(out, "z_rich_b_ro");
    }

    #[test]
    fn test_quote_identifier() {
        use crate::dialect::Dialect;
        assert_eq!(quote_identifier(Dialect::Postgres, "t"), "\"t\"");
        assert_eq!(quote_identifier(Dialect::MySql, "t"), "`t`");
        assert_eq!(quote_identifier(Dialect::SqlServer, "t"), "[t]");
    }
}
