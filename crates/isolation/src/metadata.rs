//! Dialect-neutral table metadata and DDL rendering.
//!
//! Applications describe their tables once as a [`SchemaMetadata`] image.
//! Isolation providers render that image into `CREATE TABLE` statements for
//! a tenant's namespace: qualified by schema, inside a dedicated database, or
//! cloned under a table-name prefix via [`SchemaMetadata::with_table_prefix`].
//!
//! Every table, column, index and constraint name is validated before any
//! statement is rendered. Check-constraint expressions are application
//! metadata and are emitted verbatim.
//!
//! # Example
//!
//! ```
//! use tenantry_isolation::dialect::Dialect;
//! use tenantry_isolation::metadata::{ColumnDef, ColumnType, ForeignKeyDef, SchemaMetadata, TableDef};
//!
//! let schema = SchemaMetadata::new()
//!     .table(
//!         TableDef::new("customers")
//!             .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
//!             .column(ColumnDef::new("name", ColumnType::Text).not_null()),
//!     )
//!     .table(
//!         TableDef::new("orders")
//!             .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
//!             .column(ColumnDef::new("customer_id", ColumnType::BigInt))
//!             .foreign_key(ForeignKeyDef::new(["customer_id"], "customers", ["id"])),
//!     );
//!
//! let prefixed = schema.with_table_prefix("t_acme_");
//! let ddl = prefixed.create_statements(Dialect::Sqlite, None).unwrap();
//! assert!(ddl[1].contains("REFERENCES \"t_acme_customers\""));
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::IdentifierError;
use crate::validation::{assert_safe_column_name, assert_safe_schema_name, assert_safe_table_name, quote_identifier};

/// Portable column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Double-precision float.
    Real,
    /// Boolean.
    Boolean,
    /// Unbounded text.
    Text,
    /// Bounded text.
    Varchar(u32),
    /// Timestamp with time zone where supported.
    Timestamp,
    /// JSON document.
    Json,
    /// UUID.
    Uuid,
    /// Binary data.
    Blob,
}

impl ColumnType {
    /// Returns the SQL type name for a dialect.
    pub fn sql_type(&self, dialect: Dialect) -> String {
        use ColumnType::*;
        let name = match (self, dialect) {
            (Varchar(n), Dialect::SqlServer) => return format!("NVARCHAR({n})"),
            (Varchar(n), _) => return format!("VARCHAR({n})"),

            (Integer, Dialect::SqlServer) => "INT",
            (Integer, _) => "INTEGER",

            (BigInt, Dialect::Sqlite | Dialect::Unknown) => "INTEGER",
            (BigInt, _) => "BIGINT",

            (Real, Dialect::Postgres) => "DOUBLE PRECISION",
            (Real, Dialect::MySql) => "DOUBLE",
            (Real, Dialect::SqlServer) => "FLOAT",
            (Real, _) => "REAL",

            (Boolean, Dialect::SqlServer) => "BIT",
            (Boolean, Dialect::Sqlite | Dialect::Unknown) => "INTEGER",
            (Boolean, _) => "BOOLEAN",

            (Text, Dialect::SqlServer) => "NVARCHAR(MAX)",
            (Text, _) => "TEXT",

            (Timestamp, Dialect::Postgres) => "TIMESTAMPTZ",
            (Timestamp, Dialect::MySql) => "DATETIME(6)",
            (Timestamp, Dialect::SqlServer) => "DATETIME2",
            (Timestamp, _) => "TEXT",

            (Json, Dialect::Postgres) => "JSONB",
            (Json, Dialect::MySql) => "JSON",
            (Json, Dialect::SqlServer) => "NVARCHAR(MAX)",
            (Json, _) => "TEXT",

            (Uuid, Dialect::Postgres) => "UUID",
            (Uuid, Dialect::MySql) => "CHAR(36)",
            (Uuid, Dialect::SqlServer) => "UNIQUEIDENTIFIER",
            (Uuid, _) => "TEXT",

            (Blob, Dialect::Postgres) => "BYTEA",
            (Blob, Dialect::MySql) => "LONGBLOB",
            (Blob, Dialect::SqlServer) => "VARBINARY(MAX)",
            (Blob, _) => "BLOB",
        };
        name.to_string()
    }
}

/// Column default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    /// `NULL`.
    Null,
    /// Integer literal.
    Integer(i64),
    /// Boolean literal.
    Boolean(bool),
    /// String literal.
    Text(String),
    /// The current timestamp at insert time.
    CurrentTimestamp,
}

impl DefaultValue {
    fn render(&self, dialect: Dialect) -> String {
        match self {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Integer(n) => n.to_string(),
            DefaultValue::Boolean(b) => {
                let literal = match (dialect, b) {
                    (Dialect::Postgres | Dialect::MySql, true) => "TRUE",
                    (Dialect::Postgres | Dialect::MySql, false) => "FALSE",
                    (_, true) => "1",
                    (_, false) => "0",
                };
                literal.to_string()
            }
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
        }
    }
}

/// Action taken on referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    /// Delete referencing rows.
    Cascade,
    /// Null out the referencing columns.
    SetNull,
    /// Refuse the delete.
    Restrict,
    /// Defer the check to the end of the statement.
    NoAction,
}

impl ReferentialAction {
    fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Portable type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether the column is (part of) the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Whether the column carries a single-column unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Optional default.
    #[serde(default)]
    pub default: Option<DefaultValue>,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    /// Creates a nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }

    /// Marks the column as part of the primary key (implies `NOT NULL`).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Marks the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Adds a unique constraint on this column alone.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the column default.
    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Foreign key from this table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Referencing columns in this table.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references_table: String,
    /// Referenced columns.
    pub references_columns: Vec<String>,
    /// Optional `ON DELETE` action.
    #[serde(default)]
    pub on_delete: Option<ReferentialAction>,
}

impl ForeignKeyDef {
    /// Creates a foreign key.
    pub fn new<C, R>(columns: C, references_table: impl Into<String>, references_columns: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            references_table: references_table.into(),
            references_columns: references_columns.into_iter().map(Into::into).collect(),
            on_delete: None,
        }
    }

    /// Sets the `ON DELETE` action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }
}

/// Secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    /// Creates a non-unique index.
    pub fn new<C>(name: impl Into<String>, columns: C) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Multi-column unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueDef {
    /// Optional constraint name.
    #[serde(default)]
    pub name: Option<String>,
    /// Constrained columns.
    pub columns: Vec<String>,
}

/// Check constraint with a trusted expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDef {
    /// Optional constraint name.
    #[serde(default)]
    pub name: Option<String>,
    /// SQL boolean expression, emitted verbatim.
    pub expression: String,
}

/// One table of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Multi-column unique constraints.
    #[serde(default)]
    pub uniques: Vec<UniqueDef>,
    /// Check constraints.
    #[serde(default)]
    pub checks: Vec<CheckDef>,
}

impl TableDef {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            uniques: Vec::new(),
            checks: Vec::new(),
        }
    }

    /// Appends a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds a foreign key.
    pub fn foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Adds a secondary index.
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a multi-column unique constraint.
    pub fn unique<C>(mut self, name: Option<&str>, columns: C) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
    {
        self.uniques.push(UniqueDef {
            name: name.map(str::to_string),
            columns: columns.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Adds a check constraint.
    pub fn check(mut self, name: Option<&str>, expression: impl Into<String>) -> Self {
        self.checks.push(CheckDef {
            name: name.map(str::to_string),
            expression: expression.into(),
        });
        self
    }

    /// Returns the column with the given name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the primary key columns in declaration order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    fn validate(&self, context: &str) -> Result<(), IdentifierError> {
        assert_safe_table_name(&self.name, context)?;
        for column in &self.columns {
            assert_safe_column_name(&column.name, context)?;
        }
        for fk in &self.foreign_keys {
            assert_safe_table_name(&fk.references_table, context)?;
            for column in fk.columns.iter().chain(&fk.references_columns) {
                assert_safe_column_name(column, context)?;
            }
        }
        for index in &self.indexes {
            assert_safe_table_name(&index.name, context)?;
            for column in &index.columns {
                assert_safe_column_name(column, context)?;
            }
        }
        for unique in &self.uniques {
            if let Some(name) = &unique.name {
                assert_safe_table_name(name, context)?;
            }
            for column in &unique.columns {
                assert_safe_column_name(column, context)?;
            }
        }
        for check in self.checks.iter().filter_map(|c| c.name.as_ref()) {
            assert_safe_table_name(check, context)?;
        }
        Ok(())
    }
}

/// An ordered collection of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    /// Tables in declaration order.
    pub tables: Vec<TableDef>,
}

impl SchemaMetadata {
    /// Creates an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table, replacing any table with the same name.
    pub fn table(mut self, table: TableDef) -> Self {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self
    }

    /// Returns the table with the given name.
    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns table names in declaration order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Returns `true` if the image has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns the tables that carry `column`, i.e. the tenant-scoped tables
    /// of a shared-schema deployment.
    pub fn tenant_tables(&self, column: &str) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.get_column(column).is_some())
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Validates every name in the image.
    pub fn validate(&self) -> Result<(), IdentifierError> {
        for table in &self.tables {
            table.validate(&format!("table metadata for {:.80}", table.name))?;
        }
        Ok(())
    }

    /// Returns tables ordered so that referenced tables precede referencing
    /// ones. Cycles fall back to declaration order.
    pub fn sorted_tables(&self) -> Vec<&TableDef> {
        let names: HashSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.tables.len());

        while ordered.len() < self.tables.len() {
            let before = ordered.len();
            for table in &self.tables {
                if placed.contains(table.name.as_str()) {
                    continue;
                }
                let ready = table.foreign_keys.iter().all(|fk| {
                    let target = fk.references_table.as_str();
                    target == table.name || !names.contains(target) || placed.contains(target)
                });
                if ready {
                    placed.insert(table.name.as_str());
                    ordered.push(table);
                }
            }
            if ordered.len() == before {
                for table in &self.tables {
                    if placed.insert(table.name.as_str()) {
                        ordered.push(table);
                    }
                }
            }
        }
        ordered
    }

    /// Returns a copy with every table renamed to `prefix + name`.
    ///
    /// Foreign keys that target tables inside the image are retargeted to the
    /// prefixed names; references to tables outside the image are left alone.
    /// Index and named constraint names are prefixed as well so they stay
    /// unique per tenant. Columns, keys and defaults are preserved.
    pub fn with_table_prefix(&self, prefix: &str) -> SchemaMetadata {
        let renames: HashMap<&str, String> = self
            .tables
            .iter()
            .map(|t| (t.name.as_str(), format!("{prefix}{}", t.name)))
            .collect();

        let tables = self
            .tables
            .iter()
            .map(|table| {
                let mut clone = table.clone();
                clone.name = format!("{prefix}{}", table.name);
                for fk in &mut clone.foreign_keys {
                    if let Some(renamed) = renames.get(fk.references_table.as_str()) {
                        fk.references_table = renamed.clone();
                    }
                }
                for index in &mut clone.indexes {
                    index.name = format!("{prefix}{}", index.name);
                }
                for name in clone
                    .uniques
                    .iter_mut()
                    .filter_map(|u| u.name.as_mut())
                    .chain(clone.checks.iter_mut().filter_map(|c| c.name.as_mut()))
                {
                    *name = format!("{prefix}{name}");
                }
                clone
            })
            .collect();

        SchemaMetadata { tables }
    }

    /// Renders `CREATE TABLE` and `CREATE INDEX` statements.
    ///
    /// With `schema`, every table of the image (and every foreign key target
    /// inside it) is qualified with that schema. All names are validated
    /// before anything is rendered.
    pub fn create_statements(
        &self,
        dialect: Dialect,
        schema: Option<&str>,
    ) -> Result<Vec<String>, IdentifierError> {
        if let Some(schema) = schema {
            assert_safe_schema_name(schema, "render table metadata")?;
        }
        self.validate()?;

        let local: HashSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let qualify = |table: &str| -> String {
            match schema {
                Some(schema) if local.contains(table) => format!(
                    "{}.{}",
                    quote_identifier(dialect, schema),
                    quote_identifier(dialect, table)
                ),
                _ => quote_identifier(dialect, table),
            }
        };
        let column_list = |columns: &[String]| -> String {
            columns
                .iter()
                .map(|c| quote_identifier(dialect, c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut statements = Vec::new();
        for table in self.sorted_tables() {
            let target = qualify(&table.name);
            let mut parts = Vec::new();

            for column in &table.columns {
                let mut part = format!(
                    "{} {}",
                    quote_identifier(dialect, &column.name),
                    column.column_type.sql_type(dialect)
                );
                if !column.nullable {
                    part.push_str(" NOT NULL");
                }
                if let Some(default) = &column.default {
                    part.push_str(" DEFAULT ");
                    part.push_str(&default.render(dialect));
                }
                if column.unique && !column.primary_key {
                    part.push_str(" UNIQUE");
                }
                parts.push(part);
            }

            let pk: Vec<String> = table.primary_key_columns().into_iter().map(str::to_string).collect();
            if !pk.is_empty() {
                parts.push(format!("PRIMARY KEY ({})", column_list(&pk)));
            }
            for unique in &table.uniques {
                let named = unique
                    .name
                    .as_ref()
                    .map(|n| format!("CONSTRAINT {} ", quote_identifier(dialect, n)))
                    .unwrap_or_default();
                parts.push(format!("{named}UNIQUE ({})", column_list(&unique.columns)));
            }
            for fk in &table.foreign_keys {
                let mut part = format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({})",
                    column_list(&fk.columns),
                    qualify(&fk.references_table),
                    column_list(&fk.references_columns)
                );
                if let Some(action) = fk.on_delete {
                    part.push_str(" ON DELETE ");
                    part.push_str(action.as_sql());
                }
                parts.push(part);
            }
            for check in &table.checks {
                let named = check
                    .name
                    .as_ref()
                    .map(|n| format!("CONSTRAINT {} ", quote_identifier(dialect, n)))
                    .unwrap_or_default();
                parts.push(format!("{named}CHECK ({})", check.expression));
            }
            if dialect == Dialect::MySql {
                for index in &table.indexes {
                    let kind = if index.unique { "UNIQUE INDEX" } else { "INDEX" };
                    parts.push(format!(
                        "{kind} {} ({})",
                        quote_identifier(dialect, &index.name),
                        column_list(&index.columns)
                    ));
                }
            }

            let body = parts.join(", ");
            statements.push(match dialect {
                Dialect::SqlServer => format!(
                    "IF OBJECT_ID(N'{}', N'U') IS NULL CREATE TABLE {target} ({body})",
                    mssql_object_name(schema, &table.name)
                ),
                _ => format!("CREATE TABLE IF NOT EXISTS {target} ({body})"),
            });

            if dialect == Dialect::MySql {
                continue;
            }
            for index in &table.indexes {
                let kind = if index.unique { "UNIQUE INDEX" } else { "INDEX" };
                let name = quote_identifier(dialect, &index.name);
                let columns = column_list(&index.columns);
                statements.push(match dialect {
                    Dialect::SqlServer => format!(
                        "IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = N'{}') CREATE {kind} {name} ON {target} ({columns})",
                        index.name
                    ),
                    _ => format!("CREATE {kind} IF NOT EXISTS {name} ON {target} ({columns})"),
                });
            }
        }
        Ok(statements)
    }
}

fn mssql_object_name(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{schema}.{table}"),
        None => table.to_string(),
    }
}
