//! The registry schema: `mrsm_pipes`, `mrsm_users`, `mrsm_plugins`, and
//! the internal namespace's `temporary_tables` bookkeeping table (spec
//! §6). One JSON `parameters` document per pipe row, with a unique
//! index on `(connector, metric, location)`.

use chrono::{DateTime, Utc};
use mrsm_sql::{ColumnDef, SqlDialect};
use mrsm_core::Dtype;

pub const PIPES_TABLE: &str = "mrsm_pipes";
pub const USERS_TABLE: &str = "mrsm_users";
pub const PLUGINS_TABLE: &str = "mrsm_plugins";
pub const TEMPORARY_TABLES_TABLE: &str = "_mrsm_internal.temporary_tables";

/// Generates the bootstrap DDL for the registry tables on a given
/// dialect. Executed once at instance setup, mirroring the teacher's
/// `setup_db()` schema-as-DDL-string approach (`oxidized-state/src/handle.rs`).
pub struct RegistrySchema<'a> {
    dialect: &'a dyn SqlDialect,
}

impl<'a> RegistrySchema<'a> {
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self { dialect }
    }

    /// Every `CREATE TABLE IF NOT EXISTS` statement needed to bootstrap
    /// a fresh instance, in dependency order.
    pub fn bootstrap_sql(&self) -> Vec<String> {
        vec![
            self.pipes_table_sql(),
            self.users_table_sql(),
            self.plugins_table_sql(),
            self.temporary_tables_sql(),
            self.dialect.create_index_sql(
                PIPES_TABLE,
                "UQ_mrsm_pipes_keys",
                &["connector".into(), "metric".into(), "location".into()],
                true,
            ),
        ]
    }

    fn pipes_table_sql(&self) -> String {
        self.dialect.create_table_sql(
            PIPES_TABLE,
            &[
                ColumnDef { name: "connector", dtype: &Dtype::Str },
                ColumnDef { name: "metric", dtype: &Dtype::Str },
                ColumnDef { name: "location", dtype: &Dtype::Str },
                ColumnDef { name: "instance", dtype: &Dtype::Str },
                ColumnDef { name: "target", dtype: &Dtype::Str },
                ColumnDef { name: "columns", dtype: &Dtype::Json },
                ColumnDef { name: "dtypes", dtype: &Dtype::Json },
                ColumnDef { name: "indices", dtype: &Dtype::Json },
                ColumnDef { name: "parameters", dtype: &Dtype::Json },
            ],
        )
    }

    fn users_table_sql(&self) -> String {
        self.dialect.create_table_sql(
            USERS_TABLE,
            &[
                ColumnDef { name: "username", dtype: &Dtype::Str },
                ColumnDef { name: "password_hash", dtype: &Dtype::Str },
                ColumnDef { name: "email", dtype: &Dtype::Str },
                ColumnDef { name: "attributes", dtype: &Dtype::Json },
            ],
        )
    }

    fn plugins_table_sql(&self) -> String {
        self.dialect.create_table_sql(
            PLUGINS_TABLE,
            &[
                ColumnDef { name: "plugin_name", dtype: &Dtype::Str },
                ColumnDef { name: "username", dtype: &Dtype::Str },
                ColumnDef { name: "version", dtype: &Dtype::Str },
                ColumnDef { name: "attributes", dtype: &Dtype::Json },
            ],
        )
    }

    fn temporary_tables_sql(&self) -> String {
        self.dialect.create_table_sql(
            TEMPORARY_TABLES_TABLE,
            &[
                ColumnDef { name: "table_name", dtype: &Dtype::Str },
                ColumnDef { name: "transaction_id", dtype: &Dtype::Str },
                ColumnDef { name: "created_at", dtype: &Dtype::DateTimeUtc },
            ],
        )
    }
}

/// A row of the internal temp-table bookkeeping table. A reaper task
/// (owned by `mrsm-sync`) sweeps hourly and drops any entry past its TTL.
#[derive(Debug, Clone)]
pub struct TemporaryTableEntry {
    pub table_name: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

impl TemporaryTableEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.created_at >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrsm_sql::PostgresDialect;

    #[test]
    fn bootstrap_sql_covers_every_registry_table() {
        let dialect = PostgresDialect;
        let schema = RegistrySchema::new(&dialect);
        let statements = schema.bootstrap_sql();
        assert!(statements.iter().any(|s| s.contains(PIPES_TABLE)));
        assert!(statements.iter().any(|s| s.contains(USERS_TABLE)));
        assert!(statements.iter().any(|s| s.contains(PLUGINS_TABLE)));
        assert!(statements.iter().any(|s| s.contains("temporary_tables")));
    }

    #[test]
    fn expired_entry_detected_past_ttl() {
        let entry = TemporaryTableEntry {
            table_name: "tmp_1".into(),
            transaction_id: "tx1".into(),
            created_at: Utc::now() - chrono::Duration::hours(25),
        };
        assert!(entry.is_expired(Utc::now(), chrono::Duration::hours(24)));
    }
}
