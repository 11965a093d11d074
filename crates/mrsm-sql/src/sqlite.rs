use crate::dialect::{Flavor, SqlDialect};
use mrsm_core::Dtype;

/// SQLite has a dynamic type system (column affinity, not a hard type) and
/// no `ALTER COLUMN TYPE`; widened columns are expressed as `TEXT` affinity
/// and left to the application layer, matching spec §4.1's fallback rule.
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Sqlite
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn physical_type(&self, dtype: &Dtype) -> String {
        match dtype {
            Dtype::Int => "INTEGER".into(),
            Dtype::Float => "REAL".into(),
            Dtype::Numeric { .. } => "TEXT".into(),
            Dtype::Bool => "INTEGER".into(),
            Dtype::Str => "TEXT".into(),
            Dtype::Bytes => "BLOB".into(),
            Dtype::Uuid => "TEXT".into(),
            Dtype::Json => "TEXT".into(),
            Dtype::DateTimeNaive => "TEXT".into(),
            Dtype::DateTimeUtc => "TEXT".into(),
        }
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".into()
    }

    fn supports_null_index_upsert(&self) -> bool {
        false
    }

    fn alter_column_type_sql(&self, _table: &str, _column: &str, _dtype: &Dtype) -> Option<String> {
        None
    }

    fn upsert_sql(&self, table: &str, columns: &[String], index_columns: &[String]) -> String {
        let col_list: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let placeholders: Vec<String> = (0..columns.len()).map(|_| self.placeholder(0)).collect();
        let conflict_cols: Vec<String> = index_columns.iter().map(|c| self.quote_ident(c)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !index_columns.contains(c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = excluded.{q}")
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_alter_column_type() {
        let d = SqliteDialect;
        assert!(d.alter_column_type_sql("t", "c", &Dtype::Int).is_none());
    }

    #[test]
    fn placeholders_are_question_marks() {
        let d = SqliteDialect;
        let sql = d.upsert_sql("t", &["a".into(), "b".into()], &["a".into()]);
        assert!(sql.contains("VALUES (?, ?)"));
    }
}
