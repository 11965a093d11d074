use crate::dialect::{Flavor, SqlDialect};
use mrsm_core::Dtype;

/// Modeled at the dialect-statement-generation level only; no live driver
/// ships for this flavor (see `DESIGN.md`).
pub struct MssqlDialect;

impl SqlDialect for MssqlDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Mssql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn physical_type(&self, dtype: &Dtype) -> String {
        match dtype {
            Dtype::Int => "BIGINT".into(),
            Dtype::Float => "FLOAT".into(),
            Dtype::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({p},{s})"),
            Dtype::Numeric { .. } => "NUMERIC".into(),
            Dtype::Bool => "BIT".into(),
            Dtype::Str => "NVARCHAR(MAX)".into(),
            Dtype::Bytes => "VARBINARY(MAX)".into(),
            Dtype::Uuid => "UNIQUEIDENTIFIER".into(),
            Dtype::Json => "NVARCHAR(MAX)".into(),
            Dtype::DateTimeNaive => "DATETIME2".into(),
            Dtype::DateTimeUtc => "DATETIMEOFFSET".into(),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        format!("@p{n}")
    }

    fn supports_null_index_upsert(&self) -> bool {
        false
    }

    /// MSSQL has no `ON CONFLICT`; the statement generated here is the
    /// `MERGE` body, with the `USING (VALUES (...)) AS src (...)` row
    /// supplied by the caller via bound parameters in the same order as
    /// `columns`.
    fn upsert_sql(&self, table: &str, columns: &[String], index_columns: &[String]) -> String {
        let col_list: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        let match_on: Vec<String> = index_columns
            .iter()
            .map(|c| {
                let q = self.quote_ident(c);
                format!("tgt.{q} = src.{q}")
            })
            .collect();
        let update_set: Vec<String> = columns
            .iter()
            .filter(|c| !index_columns.contains(c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("tgt.{q} = src.{q}")
            })
            .collect();
        format!(
            "MERGE {table} AS tgt USING (VALUES ({vals})) AS src ({cols}) ON {match_on} \
             WHEN MATCHED THEN UPDATE SET {update_set} \
             WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({src_cols});",
            table = self.quote_ident(table),
            vals = placeholders.join(", "),
            cols = col_list.join(", "),
            match_on = match_on.join(" AND "),
            update_set = update_set.join(", "),
            src_cols = columns
                .iter()
                .map(|c| format!("src.{}", self.quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_statement_includes_both_branches() {
        let d = MssqlDialect;
        let sql = d.upsert_sql("t", &["id".into(), "v".into()], &["id".into()]);
        assert!(sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED"));
    }
}
