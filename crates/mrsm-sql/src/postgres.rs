use crate::dialect::{Flavor, SqlDialect};
use mrsm_core::Dtype;

pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Postgres
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn physical_type(&self, dtype: &Dtype) -> String {
        match dtype {
            Dtype::Int => "BIGINT".into(),
            Dtype::Float => "DOUBLE PRECISION".into(),
            Dtype::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({p},{s})"),
            Dtype::Numeric { .. } => "NUMERIC".into(),
            Dtype::Bool => "BOOLEAN".into(),
            Dtype::Str => "TEXT".into(),
            Dtype::Bytes => "BYTEA".into(),
            Dtype::Uuid => "UUID".into(),
            Dtype::Json => "JSONB".into(),
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
    fn numeric_precision_rendered() {
        let d = PostgresDialect;
        let t = d.physical_type(&Dtype::Numeric {
            precision: Some(10),
            scale: Some(2),
        });
        assert_eq!(t, "NUMERIC(10,2)");
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        let d = PostgresDialect;
        assert_eq!(d.quote_ident("weird\"col"), "\"weird\"\"col\"");
    }
}
