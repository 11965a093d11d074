use crate::dialect::{Flavor, SqlDialect};
use mrsm_core::Dtype;

/// Modeled at the dialect-statement-generation level only; no live driver
/// ships for this flavor (see `DESIGN.md`).
pub struct DuckdbDialect;

impl SqlDialect for DuckdbDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Duckdb
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn physical_type(&self, dtype: &Dtype) -> String {
        match dtype {
            Dtype::Int => "BIGINT".into(),
            Dtype::Float => "DOUBLE".into(),
            Dtype::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("DECIMAL({p},{s})"),
            Dtype::Numeric { .. } => "DECIMAL".into(),
            Dtype::Bool => "BOOLEAN".into(),
            Dtype::Str => "VARCHAR".into(),
            Dtype::Bytes => "BLOB".into(),
            Dtype::Uuid => "UUID".into(),
            Dtype::Json => "JSON".into(),
            Dtype::DateTimeNaive => "TIMESTAMP".into(),
            Dtype::DateTimeUtc => "TIMESTAMPTZ".into(),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_type_is_native() {
        let d = DuckdbDialect;
        assert_eq!(d.physical_type(&Dtype::Json), "JSON");
    }
}
