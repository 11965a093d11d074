use crate::dialect::{Flavor, SqlDialect};
use mrsm_core::Dtype;

/// MySQL has no `ON CONFLICT`; upserts use `ON DUPLICATE KEY UPDATE`
/// against the table's unique index (spec §4.4).
pub struct MysqlDialect;

impl SqlDialect for MysqlDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Mysql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn physical_type(&self, dtype: &Dtype) -> String {
        match dtype {
            Dtype::Int => "BIGINT".into(),
            Dtype::Float => "DOUBLE".into(),
            Dtype::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("DECIMAL({p},{s})"),
            Dtype::Numeric { .. } => "DECIMAL(65,30)".into(),
            // MySQL's BOOLEAN is a BIT(1)/TINYINT(1) alias; the spec calls
            // for an explicit dtype pin here, so use INTEGER directly.
            Dtype::Bool => "TINYINT(1)".into(),
            Dtype::Str => "TEXT".into(),
            Dtype::Bytes => "BLOB".into(),
            Dtype::Uuid => "CHAR(36)".into(),
            Dtype::Json => "JSON".into(),
            Dtype::DateTimeNaive => "DATETIME(6)".into(),
            Dtype::DateTimeUtc => "TIMESTAMP(6)".into(),
        }
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".into()
    }

    fn supports_null_index_upsert(&self) -> bool {
        false
    }

    fn alter_column_type_sql(&self, table: &str, column: &str, dtype: &Dtype) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} MODIFY COLUMN {} {}",
            self.quote_ident(table),
            self.quote_ident(column),
            self.physical_type(dtype)
        ))
    }

    fn upsert_sql(&self, table: &str, columns: &[String], index_columns: &[String]) -> String {
        let col_list: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let placeholders: Vec<String> = (0..columns.len()).map(|_| self.placeholder(0)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !index_columns.contains(c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = VALUES({q})")
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            self.quote_ident(table),
            col_list.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_uses_on_duplicate_key_update() {
        let d = MysqlDialect;
        let sql = d.upsert_sql("t", &["id".into(), "v".into()], &["id".into()]);
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains("`v` = VALUES(`v`)"));
        assert!(!sql.contains("`id` = VALUES(`id`)"));
    }

    #[test]
    fn quote_ident_uses_backticks() {
        let d = MysqlDialect;
        assert_eq!(d.quote_ident("col"), "`col`");
    }
}
