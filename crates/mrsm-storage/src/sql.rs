//! The SQL-backed `Instance`: a single `sqlx::AnyPool` driving whatever
//! dialect in `mrsm-sql` matches the pool's connection string (spec
//! §4.2, §4.5). Grounded on the teacher's `SurrealHandle` connection
//! wrapper (`oxidized-state/src/handle.rs`) — a thin struct pairing a
//! pool with setup/bootstrap, `#[instrument]`-annotated at the seams.

use async_trait::async_trait;
use chrono::Utc;
use mrsm_core::dataframe::{RecordBatch, Row};
use mrsm_core::dtype::{Dtype, Value};
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::{Pipe, PipeKeys};
use mrsm_sql::{dialect_for, ColumnDef, Flavor, SqlDialect};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::error::DatabaseError;
use sqlx::{AnyPool, Column, Row as _};
use std::collections::BTreeMap;

use crate::instance::{check_static_schema, Capabilities, Instance};
use crate::registry::{RegistrySchema, PIPES_TABLE};
use crate::types::{GetDataOptions, PipesFilter, Window};

/// A SQL instance: connection pool plus the dialect that generates its
/// statements. One `SqlInstance` per configured connector (spec §4.2:
/// "any instance is a connector that implements `Instance`").
pub struct SqlInstance {
    pool: AnyPool,
    dialect: Box<dyn SqlDialect>,
}

impl SqlInstance {
    /// Connect and bootstrap the registry tables. `flavor` must have a
    /// live `sqlx::Any` driver (Postgres, SQLite, MySQL); DuckDB and
    /// MSSQL are statement-generation-only dialects (see `DESIGN.md`).
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str, flavor: Flavor) -> Result<Self> {
        if !matches!(flavor, Flavor::Postgres | Flavor::Sqlite | Flavor::Mysql) {
            return Err(MrsmError::Configuration(format!(
                "flavor {flavor:?} has no live sqlx driver; use it for statement generation only"
            )));
        }
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| MrsmError::ConnectorUnavailable(e.to_string()))?;
        let instance = Self {
            pool,
            dialect: dialect_for(flavor),
        };
        instance.bootstrap().await?;
        Ok(instance)
    }

    async fn bootstrap(&self) -> Result<()> {
        let schema = RegistrySchema::new(self.dialect.as_ref());
        for statement in schema.bootstrap_sql() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MrsmError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    fn capabilities_for(&self) -> Capabilities {
        Capabilities {
            supports_in_place: true,
            is_thread_safe: true,
            is_instance: true,
            thread_safety_factor: self.pool.size() as usize,
        }
    }

    async fn ensure_target_table(&self, pipe: &Pipe) -> Result<()> {
        let columns: Vec<ColumnDef<'_>> = pipe
            .dtypes
            .iter()
            .map(|(name, dtype)| ColumnDef { name, dtype })
            .collect();
        let sql = self.dialect.create_table_sql(&pipe.target_table(), &columns);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn insert_batch(&self, pipe: &Pipe, batch: &RecordBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let table = pipe.target_table();
        for row in &batch.rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            let col_list: Vec<String> = columns.iter().map(|c| self.dialect.quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.dialect.placeholder(i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.dialect.quote_ident(&table),
                col_list.join(", "),
                placeholders.join(", "),
            );
            let mut query = sqlx::query(&sql);
            for col in &columns {
                query = bind_value(query, row.get(col).unwrap_or(&Value::Null));
            }
            query
                .execute(&self.pool)
                .await
                .map_err(|e| MrsmError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn upsert_batch(&self, pipe: &Pipe, batch: &RecordBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let table = pipe.target_table();
        let index_columns = pipe.index_columns();
        for row in &batch.rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            let sql = self.dialect.upsert_sql(&table, &columns, &index_columns);
            let mut query = sqlx::query(&sql);
            for col in &columns {
                query = bind_value(query, row.get(col).unwrap_or(&Value::Null));
            }
            query
                .execute(&self.pool)
                .await
                .map_err(|e| MrsmError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Numeric(d) => query.bind(d.to_string()),
        Value::Bool(b) => query.bind(*b),
        Value::Str(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Uuid(u) => query.bind(u.to_string()),
        Value::Json(j) => query.bind(j.to_string()),
        Value::DateTimeNaive(dt) => query.bind(dt.to_string()),
        Value::DateTimeUtc(dt) => query.bind(dt.to_rfc3339()),
    }
}

fn decode_row(row: &AnyRow, dtypes: &BTreeMap<String, Dtype>) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let dtype = dtypes.get(&name).cloned().unwrap_or(Dtype::Str);
        let value = decode_column(row, &name, &dtype);
        out.insert(name, value);
    }
    out
}

fn decode_column(row: &AnyRow, name: &str, dtype: &Dtype) -> Value {
    match dtype {
        Dtype::Int => row.try_get::<i64, _>(name).map(Value::Int).unwrap_or(Value::Null),
        Dtype::Float => row.try_get::<f64, _>(name).map(Value::Float).unwrap_or(Value::Null),
        Dtype::Bool => row.try_get::<bool, _>(name).map(Value::Bool).unwrap_or(Value::Null),
        Dtype::Numeric { .. } => row
            .try_get::<String, _>(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Value::Numeric)
            .unwrap_or(Value::Null),
        Dtype::Uuid => row
            .try_get::<String, _>(name)
            .ok()
            .and_then(|s| uuid::Uuid::parse_str(&s).ok())
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        Dtype::Json => row
            .try_get::<String, _>(name)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .map(Value::Json)
            .unwrap_or(Value::Null),
        Dtype::Bytes => row.try_get::<Vec<u8>, _>(name).map(Value::Bytes).unwrap_or(Value::Null),
        Dtype::DateTimeNaive | Dtype::DateTimeUtc | Dtype::Str => row
            .try_get::<String, _>(name)
            .map(Value::Str)
            .unwrap_or(Value::Null),
    }
}

fn window_clause(dialect: &dyn SqlDialect, datetime_col: Option<&str>, window: &Window, next_param: &mut usize) -> (String, Vec<Value>) {
    let Some(col) = datetime_col else {
        return (String::new(), Vec::new());
    };
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    if let Some(begin) = &window.begin {
        clauses.push(format!("{} >= {}", dialect.quote_ident(col), dialect.placeholder(*next_param)));
        binds.push(begin.clone());
        *next_param += 1;
    }
    if let Some(end) = &window.end {
        clauses.push(format!("{} < {}", dialect.quote_ident(col), dialect.placeholder(*next_param)));
        binds.push(end.clone());
        *next_param += 1;
    }
    if clauses.is_empty() {
        (String::new(), Vec::new())
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

/// Build a `col IN (?, ?, ...)` predicate per index column in `params`,
/// ANDed together, continuing `next_param`'s numbering (spec §4.2
/// `get_sync_time(pipe, params?, ...)`).
fn params_clause(dialect: &dyn SqlDialect, params: &BTreeMap<String, Vec<Value>>, next_param: &mut usize) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    for (column, values) in params {
        if values.is_empty() {
            continue;
        }
        let placeholders: Vec<String> = values
            .iter()
            .map(|_| {
                let p = dialect.placeholder(*next_param);
                *next_param += 1;
                p
            })
            .collect();
        clauses.push(format!("{} IN ({})", dialect.quote_ident(column), placeholders.join(", ")));
        binds.extend(values.iter().cloned());
    }
    if clauses.is_empty() {
        (String::new(), Vec::new())
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

#[async_trait]
impl Instance for SqlInstance {
    fn capabilities(&self) -> Capabilities {
        self.capabilities_for()
    }

    async fn register_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let sql = format!(
            "INSERT INTO {} (connector, metric, location, instance, target, columns, dtypes, indices, parameters) \
             VALUES ({p1}, {p2}, {p3}, {p4}, {p5}, {p6}, {p7}, {p8}, {p9})",
            self.dialect.quote_ident(PIPES_TABLE),
            p1 = self.dialect.placeholder(1),
            p2 = self.dialect.placeholder(2),
            p3 = self.dialect.placeholder(3),
            p4 = self.dialect.placeholder(4),
            p5 = self.dialect.placeholder(5),
            p6 = self.dialect.placeholder(6),
            p7 = self.dialect.placeholder(7),
            p8 = self.dialect.placeholder(8),
            p9 = self.dialect.placeholder(9),
        );
        sqlx::query(&sql)
            .bind(pipe.keys.connector.to_string())
            .bind(pipe.keys.metric.clone())
            .bind(pipe.keys.location.clone().unwrap_or_default())
            .bind(pipe.keys.instance.to_string())
            .bind(pipe.target.clone().unwrap_or_default())
            .bind(serde_json::to_string(&pipe.columns).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.dtypes).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.indices).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.parameters).unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(|e| match e.as_database_error().map(|d| d.is_unique_violation()) {
                Some(true) => MrsmError::AlreadyExists(pipe.keys.to_string()),
                _ => MrsmError::Backend(e.to_string()),
            })?;
        self.ensure_target_table(pipe).await?;
        Ok(SuccessTuple::ok(format!("registered pipe '{}'", pipe.keys)))
    }

    async fn edit_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let sql = format!(
            "UPDATE {} SET target = {p1}, columns = {p2}, dtypes = {p3}, indices = {p4}, parameters = {p5} \
             WHERE connector = {p6} AND metric = {p7} AND location = {p8}",
            self.dialect.quote_ident(PIPES_TABLE),
            p1 = self.dialect.placeholder(1),
            p2 = self.dialect.placeholder(2),
            p3 = self.dialect.placeholder(3),
            p4 = self.dialect.placeholder(4),
            p5 = self.dialect.placeholder(5),
            p6 = self.dialect.placeholder(6),
            p7 = self.dialect.placeholder(7),
            p8 = self.dialect.placeholder(8),
        );
        let result = sqlx::query(&sql)
            .bind(pipe.target.clone().unwrap_or_default())
            .bind(serde_json::to_string(&pipe.columns).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.dtypes).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.indices).unwrap_or_default())
            .bind(serde_json::to_string(&pipe.parameters).unwrap_or_default())
            .bind(pipe.keys.connector.to_string())
            .bind(pipe.keys.metric.clone())
            .bind(pipe.keys.location.clone().unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(MrsmError::NotFound(pipe.keys.to_string()));
        }
        Ok(SuccessTuple::ok(format!("edited pipe '{}'", pipe.keys)))
    }

    async fn delete_pipe(&self, keys: &PipeKeys) -> Result<SuccessTuple> {
        let sql = format!(
            "DELETE FROM {} WHERE connector = {p1} AND metric = {p2} AND location = {p3}",
            self.dialect.quote_ident(PIPES_TABLE),
            p1 = self.dialect.placeholder(1),
            p2 = self.dialect.placeholder(2),
            p3 = self.dialect.placeholder(3),
        );
        let result = sqlx::query(&sql)
            .bind(keys.connector.to_string())
            .bind(keys.metric.clone())
            .bind(keys.location.clone().unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(MrsmError::NotFound(keys.to_string()));
        }
        Ok(SuccessTuple::ok(format!("deleted pipe '{keys}'")))
    }

    async fn fetch_pipes_keys(&self, filter: &PipesFilter) -> Result<Vec<PipeKeys>> {
        let sql = format!(
            "SELECT connector, metric, location, instance FROM {}",
            self.dialect.quote_ident(PIPES_TABLE)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let connector: String = row.try_get("connector").unwrap_or_default();
            let metric: String = row.try_get("metric").unwrap_or_default();
            let location: String = row.try_get("location").unwrap_or_default();
            let instance: String = row.try_get("instance").unwrap_or_default();
            let keys = PipeKeys::new(
                mrsm_pipes::ConnectorKey::parse(&connector),
                metric,
                if location.is_empty() { None } else { Some(location) },
                mrsm_pipes::ConnectorKey::parse(&instance),
            );
            if passes_filter(&keys, filter) {
                out.push(keys);
            }
        }
        Ok(out)
    }

    async fn get_pipe_attributes(&self, keys: &PipeKeys) -> Result<Option<Pipe>> {
        let sql = format!(
            "SELECT target, columns, dtypes, indices, parameters FROM {} \
             WHERE connector = {p1} AND metric = {p2} AND location = {p3}",
            self.dialect.quote_ident(PIPES_TABLE),
            p1 = self.dialect.placeholder(1),
            p2 = self.dialect.placeholder(2),
            p3 = self.dialect.placeholder(3),
        );
        let row = sqlx::query(&sql)
            .bind(keys.connector.to_string())
            .bind(keys.metric.clone())
            .bind(keys.location.clone().unwrap_or_default())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let mut pipe = Pipe::new(keys.clone());
        let target: String = row.try_get("target").unwrap_or_default();
        pipe.target = if target.is_empty() { None } else { Some(target) };
        pipe.columns = row
            .try_get::<String, _>("columns")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        pipe.dtypes = row
            .try_get::<String, _>("dtypes")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        pipe.indices = row
            .try_get::<String, _>("indices")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        pipe.parameters = row
            .try_get::<String, _>("parameters")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Ok(Some(pipe))
    }

    async fn pipe_exists(&self, pipe: &Pipe) -> Result<bool> {
        Ok(self.get_pipe_attributes(&pipe.keys).await?.is_some())
    }

    async fn get_columns_types(&self, pipe: &Pipe) -> Result<BTreeMap<String, Dtype>> {
        Ok(self
            .get_pipe_attributes(&pipe.keys)
            .await?
            .map(|p| p.dtypes)
            .unwrap_or_default())
    }

    async fn create_indices(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        for (name, columns) in pipe.resolved_indices() {
            let unique = name == mrsm_pipes::pipe::UNIQUE_INDEX_NAME;
            let sql = self.dialect.create_index_sql(&pipe.target_table(), &name, &columns, unique);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MrsmError::Backend(e.to_string()))?;
        }
        Ok(SuccessTuple::ok("indices created"))
    }

    async fn drop_indices(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        for name in pipe.resolved_indices().keys() {
            let sql = format!("DROP INDEX IF EXISTS {}", self.dialect.quote_ident(name));
            let _ = sqlx::query(&sql).execute(&self.pool).await;
        }
        Ok(SuccessTuple::ok("indices dropped"))
    }

    async fn drop_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.dialect.quote_ident(&pipe.target_table()));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(SuccessTuple::ok(format!("dropped table for '{}'", pipe.keys)))
    }

    async fn add_column(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple> {
        check_static_schema(pipe, column)?;
        let sql = self.dialect.add_column_sql(&pipe.target_table(), column, dtype);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(SuccessTuple::ok(format!("added column '{column}'")))
    }

    async fn alter_column_type(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple> {
        match self.dialect.alter_column_type_sql(&pipe.target_table(), column, dtype) {
            Some(sql) => {
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| MrsmError::Backend(e.to_string()))?;
                Ok(SuccessTuple::ok(format!("widened column '{column}' to {dtype}")))
            }
            None => Err(MrsmError::SchemaConflict {
                column: column.to_string(),
                reason: format!("{:?} has no in-place column-type alteration", self.dialect.flavor()),
            }),
        }
    }

    async fn get_sync_time(
        &self,
        pipe: &Pipe,
        params: &BTreeMap<String, Vec<Value>>,
        newest: bool,
        _remote: bool,
    ) -> Result<Option<Value>> {
        let Some(dt_col) = pipe.datetime_column() else {
            return Ok(None);
        };
        let mut next_param = 1;
        let (clause, binds) = params_clause(self.dialect.as_ref(), params, &mut next_param);
        let order = if newest { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {} FROM {}{clause} ORDER BY {} {} LIMIT 1",
            self.dialect.quote_ident(dt_col),
            self.dialect.quote_ident(&pipe.target_table()),
            self.dialect.quote_ident(dt_col),
            order,
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind_value(query, bind);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(row.map(|r| decode_column(&r, dt_col, pipe.dtypes.get(dt_col).unwrap_or(&Dtype::DateTimeUtc))))
    }

    async fn get_rowcount(&self, pipe: &Pipe, window: &Window, _remote: bool) -> Result<i64> {
        let mut next_param = 1;
        let (clause, binds) = window_clause(self.dialect.as_ref(), pipe.datetime_column(), window, &mut next_param);
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {}{clause}",
            self.dialect.quote_ident(&pipe.target_table())
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind_value(query, bind);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0))
    }

    async fn get_data(&self, pipe: &Pipe, options: &GetDataOptions) -> Result<RecordBatch> {
        let mut next_param = 1;
        let (clause, binds) = window_clause(self.dialect.as_ref(), pipe.datetime_column(), &options.window, &mut next_param);
        let select_list = match &options.select {
            Some(cols) => cols.iter().map(|c| self.dialect.quote_ident(c)).collect::<Vec<_>>().join(", "),
            None => "*".to_string(),
        };
        let order = pipe
            .datetime_column()
            .map(|c| format!(" ORDER BY {} {}", self.dialect.quote_ident(c), if options.order_descending { "DESC" } else { "ASC" }))
            .unwrap_or_default();
        let limit = options.limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let sql = format!(
            "SELECT {select_list} FROM {}{clause}{order}{limit}",
            self.dialect.quote_ident(&pipe.target_table())
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind_value(query, bind);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        let mut batch = RecordBatch::new(rows.iter().map(|r| decode_row(r, &pipe.dtypes)).collect());
        if !options.params.is_empty() {
            batch = batch.filter_by_params(&options.params);
        }
        if let Some(omit) = &options.omit {
            let keep: Vec<String> = pipe.dtypes.keys().filter(|c| !omit.contains(c)).cloned().collect();
            batch = batch.project(&keep);
        }
        Ok(batch)
    }

    async fn sync_pipe(&self, pipe: &Pipe, unseen: &RecordBatch, update: &RecordBatch) -> Result<SuccessTuple> {
        if pipe.parameters.upsert {
            self.upsert_batch(pipe, unseen).await?;
            self.upsert_batch(pipe, update).await?;
        } else {
            self.insert_batch(pipe, unseen).await?;
            self.upsert_batch(pipe, update).await?;
        }
        Ok(SuccessTuple::ok(format!(
            "inserted {}, updated {} row(s)",
            unseen.len(),
            update.len()
        )))
    }

    async fn clear_pipe(&self, pipe: &Pipe, window: &Window) -> Result<SuccessTuple> {
        let mut next_param = 1;
        let (clause, binds) = window_clause(self.dialect.as_ref(), pipe.datetime_column(), window, &mut next_param);
        let sql = format!("DELETE FROM {}{clause}", self.dialect.quote_ident(&pipe.target_table()));
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind_value(query, bind);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(SuccessTuple::ok(format!("cleared {} row(s)", result.rows_affected())))
    }

    /// Source==target fast path (spec §4.5): the diff is computed
    /// entirely in SQL via the dialect's anti-join, then inserted
    /// straight through without ever materializing rows in the process.
    async fn sync_pipe_inplace(&self, pipe: &Pipe, source_query: &str) -> Result<Option<SuccessTuple>> {
        let index_columns = pipe.index_columns();
        let diff_sql = self
            .dialect
            .inplace_diff_sql(source_query, &pipe.target_table(), &index_columns);
        let insert_sql = format!(
            "INSERT INTO {} {}",
            self.dialect.quote_ident(&pipe.target_table()),
            diff_sql
        );
        let result = sqlx::query(&insert_sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MrsmError::Backend(e.to_string()))?;
        Ok(Some(SuccessTuple::ok(format!(
            "inserted {} row(s) in place",
            result.rows_affected()
        ))))
    }
}

fn passes_filter(keys: &PipeKeys, filter: &PipesFilter) -> bool {
    let pattern_ok = |patterns: &[String], value: &str| patterns.is_empty() || patterns.iter().any(|p| glob_match(p, value));
    pattern_ok(&filter.connector_patterns, &keys.connector.label)
        && pattern_ok(&filter.metric_patterns, &keys.metric)
        && pattern_ok(&filter.location_patterns, keys.location.as_deref().unwrap_or(""))
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('_') {
        return !glob_match(rest, value);
    }
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => value.starts_with(prefix) && value.ends_with(suffix),
        None => pattern == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrsm_pipes::ConnectorKey;

    fn sample_pipe() -> Pipe {
        let keys = PipeKeys::new(ConnectorKey::new("sql", "source"), "temp", None, ConnectorKey::new("sql", "main"));
        let mut p = Pipe::new(keys);
        p.columns.insert("datetime".into(), "dt".into());
        p.columns.insert("id".into(), "id".into());
        p.dtypes.insert("dt".into(), Dtype::DateTimeUtc);
        p.dtypes.insert("id".into(), Dtype::Int);
        p
    }

    #[test]
    fn glob_match_used_by_fetch_pipes_keys_filter() {
        assert!(glob_match("temp*", "temperature"));
        assert!(!glob_match("_temp*", "temperature"));
    }

    #[test]
    fn connect_rejects_flavors_without_a_live_driver() {
        let fut = SqlInstance::connect("duckdb://mem", Flavor::Duckdb);
        let err = futures::executor::block_on(fut).unwrap_err();
        assert!(matches!(err, MrsmError::Configuration(_)));
    }

    #[tokio::test]
    async fn register_pipe_twice_returns_already_exists() {
        let instance = SqlInstance::connect("sqlite::memory:", Flavor::Sqlite).await.unwrap();
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let err = instance.register_pipe(&pipe).await.unwrap_err();
        assert!(matches!(err, MrsmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_sync_time_honors_the_params_filter() {
        let instance = SqlInstance::connect("sqlite::memory:", Flavor::Sqlite).await.unwrap();
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();

        let batch = RecordBatch::from_json_rows(&[
            serde_json::json!({"dt": "2022-01-01T00:00:00Z", "id": 1}),
            serde_json::json!({"dt": "2022-06-01T00:00:00Z", "id": 2}),
        ])
        .unwrap();
        instance.sync_pipe(&pipe, &batch, &RecordBatch::default()).await.unwrap();

        let mut params = BTreeMap::new();
        params.insert("id".to_string(), vec![Value::Int(1)]);
        let newest = instance.get_sync_time(&pipe, &params, true, false).await.unwrap();
        assert_eq!(newest, Some(Value::DateTimeUtc("2022-01-01T00:00:00Z".parse().unwrap())));

        let unfiltered = instance.get_sync_time(&pipe, &BTreeMap::new(), true, false).await.unwrap();
        assert_eq!(unfiltered, Some(Value::DateTimeUtc("2022-06-01T00:00:00Z".parse().unwrap())));
    }
}
