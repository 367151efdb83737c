//! Database dialect detection and capability matrix.
//!
//! The engine family is classified from the connection URL scheme. Driver
//! qualifiers such as `postgresql+asyncpg` or `sqlite+aiosqlite` are accepted
//! and ignored. Unrecognized schemes classify as [`Dialect::Unknown`], which
//! behaves like SQLite for isolation purposes (no schemas, no native row
//! security, table-prefix namespaces).
//!
//! | Dialect | Native schemas | Native RLS | Schema = database |
//! |---------|----------------|------------|-------------------|
//! | Postgres | yes | yes | no |
//! | SQLite | no | no | no |
//! | MySQL / MariaDB | no | no | yes |
//! | SQL Server | yes | no | no |
//! | Unknown | no | no | no |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::validation::{MAX_IDENTIFIER_BYTES, quote_identifier, sanitize_identifier};

/// Session variable carrying the current tenant for row-level security policies.
pub const DEFAULT_TENANT_SESSION_VARIABLE: &str = "app.current_tenant";

/// Longest slug head kept by [`DialectCapabilities::table_name_prefix`].
const PREFIX_SLUG_BYTES: usize = 10;

/// Engine family targeted by a connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL and wire-compatible engines.
    Postgres,
    /// SQLite, file-based or in-memory.
    Sqlite,
    /// MySQL and MariaDB.
    MySql,
    /// Microsoft SQL Server.
    SqlServer,
    /// Anything else.
    Unknown,
}

impl Dialect {
    /// Classifies a connection URL by its scheme.
    ///
    /// ```
    /// use tenantry_isolation::dialect::Dialect;
    ///
    /// assert_eq!(Dialect::from_url("postgresql+asyncpg://u:p@h/db"), Dialect::Postgres);
    /// assert_eq!(Dialect::from_url("sqlite:///./data/main.db"), Dialect::Sqlite);
    /// assert_eq!(Dialect::from_url("MARIADB://h/db"), Dialect::MySql);
    /// assert_eq!(Dialect::from_url("oracle://h/db"), Dialect::Unknown);
    /// ```
    pub fn from_url(url: &str) -> Self {
        let Some((scheme, _)) = url.split_once("://") else {
            return Dialect::Unknown;
        };
        let scheme = scheme.to_ascii_lowercase();
        let family = scheme.split('+').next().unwrap_or_default();
        match family {
            "postgresql" | "postgres" | "asyncpg" => Dialect::Postgres,
            "sqlite" | "aiosqlite" => Dialect::Sqlite,
            "mysql" | "mariadb" => Dialect::MySql,
            "mssql" | "sqlserver" => Dialect::SqlServer,
            _ => Dialect::Unknown,
        }
    }

    /// Returns the lowercase dialect name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
            Dialect::SqlServer => "sqlserver",
            Dialect::Unknown => "unknown",
        }
    }

    /// Returns the positional bind placeholder for the `n`th parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => format!("?{n}"),
            Dialect::SqlServer => format!("@p{n}"),
            Dialect::MySql | Dialect::Unknown => "?".to_string(),
        }
    }

    /// Statement creating a schema unless it exists. `schema` must already be
    /// validated. `None` for dialects without native schemas.
    pub fn create_schema_statement(&self, schema: &str) -> Option<String> {
        let quoted = quote_identifier(*self, schema);
        match self {
            Dialect::Postgres => Some(format!("CREATE SCHEMA IF NOT EXISTS {quoted}")),
            // CREATE SCHEMA must open its own batch on SQL Server.
            Dialect::SqlServer => Some(format!(
                "IF SCHEMA_ID(N'{schema}') IS NULL EXEC('CREATE SCHEMA {quoted}')"
            )),
            _ => None,
        }
    }

    /// Statement dropping a schema and, where supported, everything in it.
    pub fn drop_schema_statement(&self, schema: &str) -> Option<String> {
        let quoted = quote_identifier(*self, schema);
        match self {
            Dialect::Postgres => Some(format!("DROP SCHEMA IF EXISTS {quoted} CASCADE")),
            Dialect::SqlServer => Some(format!("DROP SCHEMA IF EXISTS {quoted}")),
            _ => None,
        }
    }

    /// Query returning a row iff the schema bound as the only parameter exists.
    pub fn schema_exists_query(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SELECT 1 FROM pg_namespace WHERE nspname = $1"),
            Dialect::SqlServer => Some("SELECT 1 FROM sys.schemas WHERE name = @p1"),
            _ => None,
        }
    }

    /// Query returning a row iff the database bound as the only parameter exists.
    pub fn database_exists_query(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SELECT 1 FROM pg_database WHERE datname = $1"),
            Dialect::MySql => {
                Some("SELECT 1 FROM information_schema.schemata WHERE schema_name = ?")
            }
            Dialect::SqlServer => Some("SELECT 1 FROM sys.databases WHERE name = @p1"),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static capability matrix for one connection target.
///
/// Built once from a URL; every query is a constant-time lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectCapabilities {
    dialect: Dialect,
    in_memory: bool,
}

impl DialectCapabilities {
    /// Builds the capability matrix for a connection URL.
    pub fn from_url(url: &str) -> Self {
        let dialect = Dialect::from_url(url);
        let in_memory = dialect == Dialect::Sqlite && is_in_memory_sqlite(url);
        Self { dialect, in_memory }
    }

    /// Builds the capability matrix for a dialect with a file or server target.
    pub fn for_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            in_memory: false,
        }
    }

    /// Returns the classified dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Returns `true` if the target is a file-less in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Whether the engine supports `CREATE SCHEMA` and per-session schema activation.
    pub fn supports_native_schemas(&self) -> bool {
        matches!(self.dialect, Dialect::Postgres | Dialect::SqlServer)
    }

    /// Whether the engine enforces row-level security policies natively.
    pub fn supports_native_row_level_security(&self) -> bool {
        self.dialect == Dialect::Postgres
    }

    /// Whether every connection must reach one shared, pinned database.
    ///
    /// True only for in-memory engines, where each new connection would
    /// otherwise open a fresh, empty database.
    pub fn requires_static_connection_pool(&self) -> bool {
        self.in_memory
    }

    /// Whether "schema" is merely a synonym for "database" on this engine.
    pub fn schema_is_database_synonym(&self) -> bool {
        self.dialect == Dialect::MySql
    }

    /// Whether databases can be created online from a regular connection.
    pub fn supports_online_database_creation(&self) -> bool {
        matches!(
            self.dialect,
            Dialect::Postgres | Dialect::MySql | Dialect::Sqlite
        )
    }

    /// Parameterized statement that binds the current tenant to the session.
    ///
    /// The statement takes the tenant id as its only bound parameter. `None`
    /// means the engine has no equivalent and explicit filtering is the only
    /// isolation mechanism.
    pub fn set_tenant_session_variable_statement(&self, variable: &str) -> Option<String> {
        match self.dialect {
            Dialect::Postgres => Some(format!(
                "SELECT set_config('{}', $1, false)",
                session_variable_literal(variable)?
            )),
            _ => None,
        }
    }

    /// Parameterized statement that makes a schema the session's active target.
    ///
    /// Takes the full search path as its only bound parameter.
    pub fn schema_activation_statement(&self) -> Option<&'static str> {
        match self.dialect {
            Dialect::Postgres => Some("SELECT set_config('search_path', $1, false)"),
            _ => None,
        }
    }

    /// Returns a short, DDL-safe table-name prefix for a tenant identifier.
    ///
    /// The prefix is `t_<slug>_<digest>__`: a readable head of the sanitized
    /// identifier (at most 10 bytes), then eight hex digits of a digest of the
    /// full identifier, then a double underscore. Slugs never contain `__`, so
    /// the first `__` of a prefixed table name always ends its prefix and no
    /// tenant's prefix is a string prefix of another tenant's tables.
    ///
    /// The prefix never exceeds 23 bytes, so `prefix + table_name` stays within
    /// the 63-byte identifier limit for table names up to 40 bytes.
    ///
    /// ```
    /// use tenantry_isolation::dialect::DialectCapabilities;
    ///
    /// let caps = DialectCapabilities::from_url("sqlite:///:memory:");
    /// assert_eq!(caps.table_name_prefix("acme-corp"), "t_acme_corp_6a3f9342__");
    /// assert_eq!(caps.table_name_prefix("my.company"), "t_my_company_0bc36d6e__");
    /// ```
    pub fn table_name_prefix(&self, identifier: &str) -> String {
        table_name_prefix(identifier)
    }

    /// Longest table name that still fits once prefixed for `identifier`.
    pub fn max_prefixed_table_name(&self, identifier: &str) -> usize {
        MAX_IDENTIFIER_BYTES.saturating_sub(table_name_prefix(identifier).len())
    }
}

/// Returns the table-name prefix for a tenant identifier.
///
/// See [`DialectCapabilities::table_name_prefix`].
pub fn table_name_prefix(identifier: &str) -> String {
    let slug = sanitize_identifier(identifier);
    // ASCII only, so byte slicing is char-safe.
    let head = slug[..slug.len().min(PREFIX_SLUG_BYTES)].trim_end_matches('_');
    format!("t_{head}_{:08x}__", fnv1a(identifier.as_bytes()))
}

/// Prefix part of a prefixed table name, up to and including its first `__`.
pub fn prefix_of_table(table: &str) -> Option<&str> {
    table.find("__").map(|at| &table[..at + 2])
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Strips the driver qualifier from a URL scheme (`postgresql+asyncpg://` → `postgresql://`).
pub fn strip_driver_qualifier(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((family, _)) => format!("{family}://{rest}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

fn is_in_memory_sqlite(url: &str) -> bool {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };
    let path = path.trim_start_matches('/');
    path.is_empty() || path == ":memory:" || query.split('&').any(|p| p == "mode=memory")
}

/// Session variable names become part of a string literal, so only dotted
/// identifiers are allowed.
pub(crate) fn session_variable_literal(variable: &str) -> Option<&str> {
    let valid = !variable.is_empty()
        && variable.len() <= MAX_IDENTIFIER_BYTES
        && variable
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.');
    valid.then_some(variable)
}
