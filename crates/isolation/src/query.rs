//! Minimal structured queries.
//!
//! [`Query`] is the value that [`IsolationProvider::apply_filter`] rewrites:
//! a single-table statement whose values are always bound as parameters and
//! whose identifiers are validated at render time. Providers add a tenant
//! predicate through [`Query::with_tenant_filter`]; sessions that enforce
//! filtering refuse to run queries that lack it.
//!
//! [`IsolationProvider::apply_filter`]: crate::isolation::IsolationProvider::apply_filter
//!
//! ```
//! use tenantry_isolation::dialect::Dialect;
//! use tenantry_isolation::query::Query;
//!
//! let query = Query::select("orders")
//!     .filter_eq("status", "open")
//!     .with_tenant_filter("tenant_id", &"t1".into())
//!     .limit(10);
//!
//! let stmt = query.to_sql(Dialect::Postgres).unwrap();
//! assert_eq!(
//!     stmt.sql,
//!     "SELECT * FROM \"orders\" WHERE \"tenant_id\" = $1 AND \"status\" = $2 LIMIT 10"
//! );
//! assert_eq!(stmt.params.len(), 2);
//! ```

use crate::dialect::Dialect;
use crate::engine::SqlValue;
use crate::error::IdentifierError;
use crate::tenant::TenantId;
use crate::validation::{assert_safe_column_name, assert_safe_table_name, quote_identifier};

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `LIKE`
    Like,
}

impl Operator {
    fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Select(Vec<String>),
    Count,
    Update(Vec<(String, SqlValue)>),
    Delete,
    Insert(Vec<(String, SqlValue)>),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Compare {
        column: String,
        op: Operator,
        value: SqlValue,
    },
    IsNull {
        column: String,
        negated: bool,
    },
}

/// A single-table statement with bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    kind: Kind,
    predicates: Vec<Predicate>,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    tenant_filter: Option<(String, TenantId)>,
}

/// Rendered SQL text plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with dialect placeholders.
    pub sql: String,
    /// Bound parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

impl Query {
    fn new(table: impl Into<String>, kind: Kind) -> Self {
        Self {
            table: table.into(),
            kind,
            predicates: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            tenant_filter: None,
        }
    }

    /// `SELECT *` from a table.
    pub fn select(table: impl Into<String>) -> Self {
        Self::new(table, Kind::Select(Vec::new()))
    }

    /// `SELECT COUNT(*)` from a table. The count is returned as column `count`.
    pub fn count(table: impl Into<String>) -> Self {
        Self::new(table, Kind::Count)
    }

    /// `UPDATE` a table; add assignments with [`set`](Self::set).
    pub fn update(table: impl Into<String>) -> Self {
        Self::new(table, Kind::Update(Vec::new()))
    }

    /// `DELETE FROM` a table.
    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, Kind::Delete)
    }

    /// `INSERT INTO` a table; add values with [`value`](Self::value).
    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(table, Kind::Insert(Vec::new()))
    }

    /// Restricts a select to the given columns.
    pub fn columns<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if let Kind::Select(cols) = &mut self.kind {
            *cols = columns.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Adds an assignment to an update.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        if let Kind::Update(assignments) = &mut self.kind {
            assignments.push((column.into(), value.into()));
        }
        self
    }

    /// Adds a column value to an insert.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        if let Kind::Insert(values) = &mut self.kind {
            values.push((column.into(), value.into()));
        }
        self
    }

    /// Adds `column = value`.
    pub fn filter_eq(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.filter(column, Operator::Eq, value)
    }

    /// Adds `column <op> value`.
    pub fn filter(mut self, column: impl Into<String>, op: Operator, value: impl Into<SqlValue>) -> Self {
        self.predicates.push(Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Adds `column IS NULL` (or `IS NOT NULL` when `negated`).
    pub fn filter_null(mut self, column: impl Into<String>, negated: bool) -> Self {
        self.predicates.push(Predicate::IsNull {
            column: column.into(),
            negated,
        });
        self
    }

    /// Adds an ordering term.
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by.push((column.into(), ascending));
        self
    }

    /// Caps the number of returned rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Scopes the statement to one tenant.
    ///
    /// Reads, updates and deletes gain a leading `column = tenant_id`
    /// predicate. Inserts have `column` forced to `tenant_id`. Applying the
    /// filter again replaces the previous one.
    pub fn with_tenant_filter(mut self, column: impl Into<String>, tenant_id: &TenantId) -> Self {
        self.tenant_filter = Some((column.into(), tenant_id.clone()));
        self
    }

    /// Returns the logical table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the tenant filter, if any.
    pub fn tenant_filter(&self) -> Option<(&str, &TenantId)> {
        self.tenant_filter.as_ref().map(|(c, t)| (c.as_str(), t))
    }

    /// Whether the statement is scoped to exactly this tenant and column.
    pub fn is_tenant_filtered(&self, column: &str, tenant_id: &TenantId) -> bool {
        self.tenant_filter() == Some((column, tenant_id))
    }

    /// Whether the statement only reads.
    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, Kind::Select(_) | Kind::Count)
    }

    /// Renders the statement against its own (quoted) table name.
    pub fn to_sql(&self, dialect: Dialect) -> Result<Statement, IdentifierError> {
        assert_safe_table_name(&self.table, "render query")?;
        self.render(dialect, &quote_identifier(dialect, &self.table))
    }

    /// Renders the statement against an already quoted (and possibly
    /// qualified or prefixed) table reference.
    pub fn render(&self, dialect: Dialect, table_sql: &str) -> Result<Statement, IdentifierError> {
        let mut params = Vec::new();
        let bind = |value: SqlValue, params: &mut Vec<SqlValue>| {
            params.push(value);
            dialect.placeholder(params.len())
        };
        let column = |name: &str| -> Result<String, IdentifierError> {
            assert_safe_column_name(name, "render query")?;
            Ok(quote_identifier(dialect, name))
        };

        // SQL Server has no LIMIT clause.
        let top = match (dialect, self.limit) {
            (Dialect::SqlServer, Some(limit)) => format!("TOP ({limit}) "),
            _ => String::new(),
        };

        let mut sql = match &self.kind {
            Kind::Select(columns) if columns.is_empty() => format!("SELECT {top}* FROM {table_sql}"),
            Kind::Select(columns) => {
                let list = columns
                    .iter()
                    .map(|c| column(c))
                    .collect::<Result<Vec<_>, _>>()?
                    .join(", ");
                format!("SELECT {top}{list} FROM {table_sql}")
            }
            Kind::Count => format!("SELECT COUNT(*) AS {} FROM {table_sql}", quote_identifier(dialect, "count")),
            Kind::Delete => format!("DELETE FROM {table_sql}"),
            Kind::Update(assignments) => {
                let mut parts = Vec::with_capacity(assignments.len());
                for (name, value) in assignments {
                    let col = column(name)?;
                    // A scoped update cannot move rows to another tenant.
                    let value = match &self.tenant_filter {
                        Some((tenant_column, tenant_id)) if tenant_column == name => {
                            SqlValue::from(tenant_id)
                        }
                        _ => value.clone(),
                    };
                    parts.push(format!("{col} = {}", bind(value, &mut params)));
                }
                format!("UPDATE {table_sql} SET {}", parts.join(", "))
            }
            Kind::Insert(values) => {
                let mut values: Vec<(String, SqlValue)> = values.clone();
                if let Some((tenant_column, tenant_id)) = &self.tenant_filter {
                    values.retain(|(name, _)| name != tenant_column);
                    values.insert(0, (tenant_column.clone(), SqlValue::from(tenant_id)));
                }
                let mut names = Vec::with_capacity(values.len());
                let mut marks = Vec::with_capacity(values.len());
                for (name, value) in values {
                    names.push(column(&name)?);
                    marks.push(bind(value, &mut params));
                }
                let sql = format!(
                    "INSERT INTO {table_sql} ({}) VALUES ({})",
                    names.join(", "),
                    marks.join(", ")
                );
                return Ok(Statement { sql, params });
            }
        };

        let mut conditions = Vec::new();
        if let Some((tenant_column, tenant_id)) = &self.tenant_filter {
            let col = column(tenant_column)?;
            conditions.push(format!("{col} = {}", bind(SqlValue::from(tenant_id), &mut params)));
        }
        for predicate in &self.predicates {
            match predicate {
                Predicate::Compare { column: name, op, value } => {
                    let col = column(name)?;
                    conditions.push(format!(
                        "{col} {} {}",
                        op.as_sql(),
                        bind(value.clone(), &mut params)
                    ));
                }
                Predicate::IsNull { column: name, negated } => {
                    let col = column(name)?;
                    let test = if *negated { "IS NOT NULL" } else { "IS NULL" };
                    conditions.push(format!("{col} {test}"));
                }
            }
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if matches!(self.kind, Kind::Select(_)) {
            if !self.order_by.is_empty() {
                let terms = self
                    .order_by
                    .iter()
                    .map(|(name, asc)| -> Result<String, IdentifierError> {
                        let direction = if *asc { "ASC" } else { "DESC" };
                        Ok(format!("{} {direction}", column(name)?))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                sql.push_str(" ORDER BY ");
                sql.push_str(&terms.join(", "));
            }
            if let Some(limit) = self.limit
                && dialect != Dialect::SqlServer
            {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }

        Ok(Statement { sql, params })
    }
}
