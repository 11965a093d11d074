//! The `SqlDialect` trait: one implementation per backend flavor.
//!
//! Grounded on the per-dialect trait shape used for multi-backend query
//! generation: a single trait with required identity/DDL methods and
//! default methods (`upsert_sql`, `merge_sql`) that flavors override only
//! when their SQL doesn't fit the common shape (MSSQL's `MERGE`, MySQL's
//! `ON DUPLICATE KEY UPDATE`).

use mrsm_core::Dtype;

/// The SQL backend a pipe's instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    Postgres,
    Sqlite,
    Duckdb,
    Mssql,
    Mysql,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Postgres => "postgres",
            Flavor::Sqlite => "sqlite",
            Flavor::Duckdb => "duckdb",
            Flavor::Mssql => "mssql",
            Flavor::Mysql => "mysql",
        }
    }
}

/// A column name + dtype pair, as used when generating `CREATE`/`ALTER
/// TABLE` statements.
pub struct ColumnDef<'a> {
    pub name: &'a str,
    pub dtype: &'a Dtype,
}

/// Per-flavor SQL generation. Every method is pure string generation —
/// no connection or I/O lives here; `mrsm-storage` is the caller that
/// actually executes what these methods produce.
pub trait SqlDialect: Send + Sync {
    fn flavor(&self) -> Flavor;

    /// Quote an identifier (table/column name) for safe interpolation.
    fn quote_ident(&self, ident: &str) -> String;

    /// The physical column type backing a logical [`Dtype`] on this
    /// flavor (spec §4.1's per-flavor physical type table).
    fn physical_type(&self, dtype: &Dtype) -> String;

    /// Placeholder syntax for the `n`th (1-indexed) bound parameter.
    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    /// Whether this flavor can upsert correctly when one or more index
    /// columns may be null (spec §9 Open Question: treated as a reported
    /// capability, not an enforced error).
    fn supports_null_index_upsert(&self) -> bool {
        true
    }

    fn create_table_sql(&self, table: &str, columns: &[ColumnDef<'_>]) -> String {
        let cols: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", self.quote_ident(c.name), self.physical_type(c.dtype)))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote_ident(table),
            cols.join(", ")
        )
    }

    fn add_column_sql(&self, table: &str, column: &str, dtype: &Dtype) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote_ident(table),
            self.quote_ident(column),
            self.physical_type(dtype)
        )
    }

    /// `ALTER COLUMN ... TYPE ...`, or `None` when this flavor has no
    /// in-place column-type-widening statement (SQLite has none; callers
    /// fall back to widening the in-memory batch to text and accepting a
    /// schema-conflict on the stored side, per spec §4.1).
    fn alter_column_type_sql(&self, table: &str, column: &str, dtype: &Dtype) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.quote_ident(table),
            self.quote_ident(column),
            self.physical_type(dtype)
        ))
    }

    fn create_index_sql(&self, table: &str, index_name: &str, columns: &[String], unique: bool) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            self.quote_ident(index_name),
            self.quote_ident(table),
            cols.join(", ")
        )
    }

    /// Insert-or-update statement keyed on `index_columns`, updating
    /// every column in `columns` that isn't an index column. Defaults to
    /// the `ON CONFLICT ... DO UPDATE` shape (Postgres/SQLite/DuckDB);
    /// MySQL and MSSQL override this.
    fn upsert_sql(&self, table: &str, columns: &[String], index_columns: &[String]) -> String {
        let col_list: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        let conflict_cols: Vec<String> = index_columns.iter().map(|c| self.quote_ident(c)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !index_columns.contains(c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = EXCLUDED.{q}")
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            self.quote_ident(table),
            col_list.join(", "),
            placeholders.join(", "),
            conflict_cols.join(", "),
            updates.join(", "),
        )
    }

    /// A set-difference anti-join used by the in-place sync fast path
    /// (spec §4.5): rows present in `source_query` whose index tuple is
    /// absent from `target`.
    fn inplace_diff_sql(&self, source_query: &str, target: &str, index_columns: &[String]) -> String {
        let join_conditions: Vec<String> = index_columns
            .iter()
            .map(|c| {
                let q = self.quote_ident(c);
                format!("src.{q} = tgt.{q}")
            })
            .collect();
        format!(
            "SELECT src.* FROM ({source_query}) AS src LEFT JOIN {} AS tgt ON {} WHERE {}",
            self.quote_ident(target),
            join_conditions.join(" AND "),
            index_columns
                .first()
                .map(|c| format!("tgt.{} IS NULL", self.quote_ident(c)))
                .unwrap_or_else(|| "TRUE".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::PostgresDialect;

    #[test]
    fn upsert_excludes_index_columns_from_update_set() {
        let dialect = PostgresDialect;
        let sql = dialect.upsert_sql(
            "metrics",
            &["id".into(), "dt".into(), "value".into()],
            &["id".into(), "dt".into()],
        );
        assert!(sql.contains("ON CONFLICT (\"id\", \"dt\")"));
        assert!(sql.contains("\"value\" = EXCLUDED.\"value\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }
}
