//! PostgreSQL store adapter.
//!
//! Resource types map to tables in one schema and rows travel as JSONB
//! (`to_jsonb(t.*)`), so no per-table structs are needed. Every identifier is
//! validated and quoted before it reaches SQL text; values are always bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{CommitToken, Mutation, Store, StoreError, StoreTransaction};
use crate::models::{
    is_valid_identifier, AuditEntry, AuditLink, KeyType, Operation, PrincipalKind,
    ResourceDescriptor, RowFilter,
};
use crate::services::metrics::STORE_OP_DURATION;
use crate::services::{IndexMethod, IndexSpec};

const AUDIT_TABLE: &str = "authz_audit_entries";

const AUDIT_COLUMNS: &str = "entry_id, sequence, resource_type, resource_id, operation, actor_id, \
     actor_kind, before_state, after_state, request_id, prev_hash, entry_hash, created_utc";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    /// Connect a new pool.
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        schema: &str,
    ) -> Result<Self, StoreError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            schema = schema,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");

        Self::from_pool(pool, schema)
    }

    pub fn from_pool(pool: PgPool, schema: &str) -> Result<Self, StoreError> {
        quote_ident(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the audit table and its append-only trigger.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Indexes that exist on tables of the configured schema.
    #[instrument(skip(self))]
    pub async fn live_indexes(&self) -> Result<Vec<IndexSpec>, StoreError> {
        let rows: Vec<LiveIndexRow> = sqlx::query_as(
            r#"
            SELECT t.relname::text AS table_name,
                   i.relname::text AS index_name,
                   am.amname::text AS method,
                   array_agg(a.attname::text ORDER BY k.ord) AS columns
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_am am ON am.oid = i.relam
            JOIN pg_namespace n ON n.oid = t.relnamespace
            CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            WHERE n.nspname = $1
            GROUP BY t.relname, i.relname, am.amname
            ORDER BY t.relname, i.relname
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let method = IndexMethod::parse(&row.method)?;
                Some(IndexSpec {
                    resource_type: row.table_name,
                    columns: row.columns,
                    method,
                    name: Some(row.index_name),
                })
            })
            .collect())
    }

    async fn select(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StoreError> {
        let timer = STORE_OP_DURATION.with_label_values(&["query"]).start_timer();
        let (sql, params) = select_sql(&self.schema, descriptor, filter, limit)?;
        let mut query = sqlx::query_scalar::<_, Value>(&sql);
        for param in params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        timer.observe_duration();
        Ok(rows)
    }

    fn table(&self, resource_type: &str) -> Result<String, StoreError> {
        qualified_table(&self.schema, resource_type)
    }
}

#[derive(FromRow)]
struct LiveIndexRow {
    table_name: String,
    index_name: String,
    method: String,
    columns: Vec<String>,
}

#[derive(FromRow)]
struct AuditEntryRow {
    entry_id: Uuid,
    sequence: i64,
    resource_type: String,
    resource_id: String,
    operation: String,
    actor_id: String,
    actor_kind: String,
    before_state: Option<Value>,
    after_state: Option<Value>,
    request_id: Option<String>,
    prev_hash: Option<String>,
    entry_hash: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AuditEntryRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditEntryRow) -> Result<Self, Self::Error> {
        let operation = Operation::parse(&row.operation).ok_or_else(|| {
            StoreError::Unavailable(format!("unknown audit operation '{}'", row.operation))
        })?;
        let actor_kind = PrincipalKind::parse(&row.actor_kind).ok_or_else(|| {
            StoreError::Unavailable(format!("unknown actor kind '{}'", row.actor_kind))
        })?;
        Ok(AuditEntry {
            entry_id: row.entry_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            operation,
            actor_id: row.actor_id,
            actor_kind,
            before_state: row.before_state,
            after_state: row.after_state,
            request_id: row.request_id,
            sequence: row.sequence,
            prev_hash: row.prev_hash,
            entry_hash: row.entry_hash,
            created_utc: row.created_utc,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, descriptor), fields(resource_type = %descriptor.resource_type))]
    async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        if !descriptor.key_type.accepts(id) {
            return Ok(None);
        }
        let timer = STORE_OP_DURATION.with_label_values(&["get"]).start_timer();
        let sql = select_by_id_sql(&self.table(&descriptor.resource_type)?, descriptor, false)?;
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, descriptor, filter), fields(resource_type = %descriptor.resource_type))]
    async fn query(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        self.select(descriptor, filter, None).await
    }

    #[instrument(skip(self, descriptor, filter), fields(resource_type = %descriptor.resource_type))]
    async fn query_limited(
        &self,
        descriptor: &ResourceDescriptor,
        filter: Option<&RowFilter>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        self.select(descriptor, filter, Some(limit)).await
    }

    #[instrument(skip(self))]
    async fn audit_entries(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM {AUDIT_TABLE} \
             WHERE resource_type = $1 AND resource_id = $2 ORDER BY sequence"
        );
        let rows: Vec<AuditEntryRow> = sqlx::query_as(&sql)
            .bind(resource_type)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

/// Open transaction. Rolls back when dropped without `commit`.
struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn get(
        &mut self,
        descriptor: &ResourceDescriptor,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        if !descriptor.key_type.accepts(id) {
            return Ok(None);
        }
        let table = qualified_table(&self.schema, &descriptor.resource_type)?;
        let sql = select_by_id_sql(&table, descriptor, true)?;
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn mutate(
        &mut self,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<Option<Value>, StoreError> {
        let timer = STORE_OP_DURATION
            .with_label_values(&[mutation.operation().as_str()])
            .start_timer();
        let table = qualified_table(&self.schema, &descriptor.resource_type)?;

        let row = match mutation {
            Mutation::Insert { payload } => {
                let sql = insert_sql(&table, payload)?;
                sqlx::query_scalar::<_, Value>(&sql)
                    .bind(payload)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(map_write_error)?
            }
            Mutation::Update { id, changes } => {
                let sql = update_sql(&table, descriptor, changes)?;
                sqlx::query_scalar::<_, Value>(&sql)
                    .bind(changes)
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(map_write_error)?
            }
            Mutation::Delete { id } => {
                let sql = delete_sql(&table, descriptor)?;
                sqlx::query_scalar::<_, Value>(&sql)
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(map_write_error)?
            }
        };

        timer.observe_duration();
        Ok(row)
    }

    async fn last_audit_link(
        &mut self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<AuditLink>, StoreError> {
        let sql = format!(
            "SELECT sequence, entry_hash FROM {AUDIT_TABLE} \
             WHERE resource_type = $1 AND resource_id = $2 ORDER BY sequence DESC LIMIT 1"
        );
        let link: Option<(i64, String)> = sqlx::query_as(&sql)
            .bind(resource_type)
            .bind(resource_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(link.map(|(sequence, entry_hash)| AuditLink {
            sequence,
            entry_hash,
        }))
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {AUDIT_TABLE} ({AUDIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        sqlx::query(&sql)
            .bind(entry.entry_id)
            .bind(entry.sequence)
            .bind(&entry.resource_type)
            .bind(&entry.resource_id)
            .bind(entry.operation.as_str())
            .bind(&entry.actor_id)
            .bind(entry.actor_kind.as_str())
            .bind(&entry.before_state)
            .bind(&entry.after_state)
            .bind(&entry.request_id)
            .bind(&entry.prev_hash)
            .bind(&entry.entry_hash)
            .bind(entry.created_utc)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitToken, StoreError> {
        self.tx.commit().await?;
        Ok(CommitToken::new())
    }
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(db_err.message().to_string())
        }
        // invalid_text_representation: a payload value the column type rejects
        sqlx::Error::Database(ref db_err) if db_err.code().as_deref() == Some("22P02") => {
            StoreError::InvalidMutation(db_err.message().to_string())
        }
        other => StoreError::Database(other),
    }
}

fn quote_ident(ident: &str) -> Result<String, StoreError> {
    if !is_valid_identifier(ident) {
        return Err(StoreError::InvalidIdentifier(ident.to_string()));
    }
    Ok(format!("\"{}\"", ident))
}

fn qualified_table(schema: &str, table: &str) -> Result<String, StoreError> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

fn object_columns(value: &Value, what: &str) -> Result<Vec<String>, StoreError> {
    let Value::Object(map) = value else {
        return Err(StoreError::InvalidMutation(format!(
            "{} must be a JSON object",
            what
        )));
    };
    map.keys().map(|k| quote_ident(k)).collect()
}

fn select_by_id_sql(
    table: &str,
    descriptor: &ResourceDescriptor,
    for_update: bool,
) -> Result<String, StoreError> {
    let mut sql = format!(
        "SELECT to_jsonb(t.*) FROM {} AS t WHERE t.{} = $1::{}",
        table,
        quote_ident(&descriptor.id_field)?,
        descriptor.key_type.sql_type()
    );
    if for_update {
        sql.push_str(" FOR UPDATE");
    }
    Ok(sql)
}

fn select_sql(
    schema: &str,
    descriptor: &ResourceDescriptor,
    filter: Option<&RowFilter>,
    limit: Option<usize>,
) -> Result<(String, Vec<String>), StoreError> {
    let table = qualified_table(schema, &descriptor.resource_type)?;
    let mut params = Vec::new();
    let mut sql = format!("SELECT to_jsonb(t.*) FROM {} AS t", table);
    if let Some(filter) = filter {
        let predicate = render_filter(filter, schema, "t", descriptor.key_type, &mut params)?;
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    sql.push_str(&format!(" ORDER BY t.{}", quote_ident(&descriptor.id_field)?));
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok((sql, params))
}

fn insert_sql(table: &str, payload: &Value) -> Result<String, StoreError> {
    let columns = object_columns(payload, "insert payload")?;
    if columns.is_empty() {
        return Ok(format!(
            "INSERT INTO {} AS t DEFAULT VALUES RETURNING to_jsonb(t.*)",
            table
        ));
    }
    let columns = columns.join(", ");
    Ok(format!(
        "INSERT INTO {table} AS t ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
         RETURNING to_jsonb(t.*)"
    ))
}

fn update_sql(
    table: &str,
    descriptor: &ResourceDescriptor,
    changes: &Value,
) -> Result<String, StoreError> {
    let columns = object_columns(changes, "update changes")?;
    if columns.is_empty() {
        return Err(StoreError::InvalidMutation(
            "update changes must name at least one column".to_string(),
        ));
    }
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = r.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "UPDATE {table} AS t SET {assignments} \
         FROM jsonb_populate_record(NULL::{table}, $1) AS r \
         WHERE t.{} = $2::{} RETURNING to_jsonb(t.*)",
        quote_ident(&descriptor.id_field)?,
        descriptor.key_type.sql_type()
    ))
}

fn delete_sql(table: &str, descriptor: &ResourceDescriptor) -> Result<String, StoreError> {
    Ok(format!(
        "DELETE FROM {} AS t WHERE t.{} = $1::{} RETURNING to_jsonb(t.*)",
        table,
        quote_ident(&descriptor.id_field)?,
        descriptor.key_type.sql_type()
    ))
}

/// Render a residual filter as a SQL predicate over `alias`, appending bound
/// values to `params`. Owner comparisons cast the parameter to the column's
/// key type so the ownership index stays usable.
pub fn render_filter(
    filter: &RowFilter,
    schema: &str,
    alias: &str,
    key_type: KeyType,
    params: &mut Vec<String>,
) -> Result<String, StoreError> {
    let cast = key_type.sql_type();
    match filter {
        RowFilter::OwnerEq {
            field,
            principal_id,
        } => {
            let column = quote_ident(field)?;
            if !key_type.accepts(principal_id) {
                return Ok("FALSE".to_string());
            }
            params.push(principal_id.clone());
            Ok(format!("{alias}.{column} = ${}::{cast}", params.len()))
        }
        RowFilter::AnyOwnerEq {
            fields,
            principal_id,
        } => {
            let columns = fields
                .iter()
                .map(|f| quote_ident(f))
                .collect::<Result<Vec<_>, StoreError>>()?;
            if columns.is_empty() || !key_type.accepts(principal_id) {
                return Ok("FALSE".to_string());
            }
            params.push(principal_id.clone());
            let n = params.len();
            let clauses = columns
                .iter()
                .map(|column| format!("{alias}.{column} = ${n}::{cast}"))
                .collect::<Vec<_>>();
            Ok(format!("({})", clauses.join(" OR ")))
        }
        RowFilter::OwnerContains {
            field,
            principal_id,
        } => {
            let column = quote_ident(field)?;
            if !key_type.accepts(principal_id) {
                return Ok("FALSE".to_string());
            }
            params.push(principal_id.clone());
            Ok(format!("{alias}.{column} @> ARRAY[${}::{cast}]", params.len()))
        }
        RowFilter::ParentMatches {
            reference_field,
            parent_type,
            parent_id_field,
            parent_key_type,
            parent_filter,
        } => {
            let parent_alias = format!("{alias}_p");
            let inner = render_filter(
                parent_filter,
                schema,
                &parent_alias,
                *parent_key_type,
                params,
            )?;
            Ok(format!(
                "{alias}.{} IN (SELECT {parent_alias}.{} FROM {} AS {parent_alias} WHERE {inner})",
                quote_ident(reference_field)?,
                quote_ident(parent_id_field)?,
                qualified_table(schema, parent_type)?,
            ))
        }
        RowFilter::FieldEquals { field, value } => {
            params.push(value.clone());
            Ok(format!(
                "{alias}.{}::text = ${}",
                quote_ident(field)?,
                params.len()
            ))
        }
        RowFilter::All(parts) => {
            if parts.is_empty() {
                return Ok("TRUE".to_string());
            }
            let clauses = parts
                .iter()
                .map(|p| render_filter(p, schema, alias, key_type, params))
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(format!("({})", clauses.join(" AND ")))
        }
    }
}
