//! Per-flavor SQL dialect layer (spec "SQL dialect layer", §4.1, §4.5).
//!
//! Pure statement generation: quoting, `CREATE`/`ALTER TABLE`, index DDL,
//! and merge/upsert statement bodies. No connection or I/O lives here —
//! `mrsm-storage` is the caller that executes what these methods produce.

pub mod dialect;
pub mod duckdb;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use dialect::{ColumnDef, Flavor, SqlDialect};
pub use duckdb::DuckdbDialect;
pub use mssql::MssqlDialect;
pub use mysql::MysqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Look up the dialect implementation for a flavor.
pub fn dialect_for(flavor: Flavor) -> Box<dyn SqlDialect> {
    match flavor {
        Flavor::Postgres => Box::new(PostgresDialect),
        Flavor::Sqlite => Box::new(SqliteDialect),
        Flavor::Duckdb => Box::new(DuckdbDialect),
        Flavor::Mssql => Box::new(MssqlDialect),
        Flavor::Mysql => Box::new(MysqlDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_for_every_flavor_matches_its_own_flavor() {
        for flavor in [
            Flavor::Postgres,
            Flavor::Sqlite,
            Flavor::Duckdb,
            Flavor::Mssql,
            Flavor::Mysql,
        ] {
            assert_eq!(dialect_for(flavor).flavor(), flavor);
        }
    }
}
