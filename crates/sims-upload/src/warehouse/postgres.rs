//! PostgreSQL warehouse
//!
//! Table names are validated identifiers from configuration and column names
//! are always quoted, so both are interpolated into SQL text. Every value is
//! bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sims_common::fingerprint::Fingerprint;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;

use super::{
    CommitReport, ExistingRecord, NormalizedCommit, RangeQuery, SchemaRequest, StagingBatch,
    Warehouse,
};
use crate::error::{IngestError, IngestResult};
use crate::ingest::identifiers::{qualified_table, quote_ident, validate_column_name};
use crate::ingest::normalizer::CanonicalRow;
use crate::ingest::schema::{ColumnType, MetadataColumn, SchemaChange};
use crate::ingest::staging::{StagedRow, StagingOutcome, STAGING_CHUNK_SIZE};

/// SQLSTATE lock_not_available
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Key tuples per overlap lookup statement
const KEY_CHUNK_SIZE: usize = 1000;

#[derive(sqlx::FromRow)]
struct StagingRecord {
    id: i64,
    row_number: i64,
    file_hash: String,
    batch_id: String,
    source_year: Option<i32>,
    ingested_at: DateTime<Utc>,
    row_data: serde_json::Value,
}

impl From<StagingRecord> for StagedRow {
    fn from(record: StagingRecord) -> Self {
        let values = match record.row_data {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(column, value)| {
                    let text = match value {
                        serde_json::Value::Null => None,
                        serde_json::Value::String(s) => Some(s),
                        other => Some(other.to_string()),
                    };
                    (column, text)
                })
                .collect(),
            _ => Default::default(),
        };

        StagedRow {
            id: record.id,
            row_number: record.row_number,
            file_hash: record.file_hash,
            batch_id: record.batch_id,
            source_year: record.source_year,
            ingested_at: record.ingested_at,
            values,
        }
    }
}

fn row_data(columns: &[String], row: &CanonicalRow) -> serde_json::Value {
    let map = columns
        .iter()
        .zip(&row.values)
        .map(|(column, value)| {
            let value = value
                .as_ref()
                .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.clone()));
            (column.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}

/// `(schema, table)` for an `information_schema` lookup
fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn lock_error(table: &str) -> impl Fn(sqlx::Error) -> IngestError + '_ {
    move |err| match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            IngestError::LockTimeout {
                table: table.to_string(),
            }
        },
        _ => IngestError::Database(err),
    }
}

pub struct PgWarehouse {
    pool: Arc<PgPool>,
}

impl PgWarehouse {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn ensure_staging_table(&self, table: &str) -> IngestResult<()> {
        let qualified = qualified_table(table)?;
        let (_, name) = split_table(table);
        let index = quote_ident(&format!("{name}_file_hash_idx"));

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("staging:{table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {qualified} (
                id BIGSERIAL PRIMARY KEY,
                file_hash TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                source_year INTEGER,
                ingested_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                row_number BIGINT NOT NULL,
                row_data JSONB NOT NULL
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {qualified} (file_hash, processed_at)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn table_exists(&self, table: &str) -> IngestResult<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(table)
            .fetch_one(&*self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn stage_rows(&self, batch: &StagingBatch<'_>) -> IngestResult<StagingOutcome> {
        let table = qualified_table(batch.table)?;
        for column in batch.columns {
            validate_column_name(column)?;
        }
        self.ensure_staging_table(batch.table).await?;

        let mut tx = self.pool.begin().await?;

        // Serialises identical submissions; released at commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(batch.table)
            .bind(batch.fingerprint.as_str())
            .execute(&mut *tx)
            .await?;

        let existing: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE file_hash = $1"))
                .bind(batch.fingerprint.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            tx.commit().await?;
            return Ok(StagingOutcome::Duplicate {
                existing_rows: existing as u64,
            });
        }

        for chunk in batch.rows.chunks(STAGING_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} (file_hash, batch_id, source_year, ingested_at, row_number, row_data) "
            ));
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(batch.fingerprint.as_str())
                    .push_bind(batch.batch_id)
                    .push_bind(batch.source_year)
                    .push_bind(batch.ingested_at)
                    .push_bind(row.row_number as i64)
                    .push_bind(row_data(batch.columns, row));
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(StagingOutcome::Staged {
            batch_id: batch.batch_id.to_string(),
            rows: batch.rows.len() as u64,
            ingested_at: batch.ingested_at,
        })
    }

    async fn staged_rows(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
    ) -> IngestResult<Vec<StagedRow>> {
        let qualified = qualified_table(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }

        let records: Vec<StagingRecord> = sqlx::query_as(&format!(
            r#"
            SELECT id, row_number, file_hash, batch_id, source_year, ingested_at, row_data
            FROM {qualified}
            WHERE file_hash = $1 AND processed_at IS NULL
            ORDER BY row_number, id
            "#
        ))
        .bind(fingerprint.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(records.into_iter().map(StagedRow::from).collect())
    }

    async fn ensure_columns(&self, request: &SchemaRequest<'_>) -> IngestResult<SchemaChange> {
        let table = qualified_table(request.table)?;
        for spec in request.columns {
            validate_column_name(&spec.name)?;
        }
        let on_lock = lock_error(request.table);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            request.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(request.workbook_type)
            .bind(request.table)
            .execute(&mut *tx)
            .await
            .map_err(&on_lock)?;

        let (schema, name) = split_table(request.table);
        let existing: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2
            "#,
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;

        let mut change = SchemaChange::default();

        if existing.is_empty() {
            let mut columns = vec!["id BIGSERIAL PRIMARY KEY".to_string()];
            columns.extend(
                request
                    .metadata
                    .iter()
                    .map(|m| format!("{} {}", quote_ident(m.name()), m.sql_type())),
            );
            columns.extend(request.columns.iter().map(|spec| {
                format!("{} {}", quote_ident(&spec.name), spec.column_type.sql_type())
            }));
            sqlx::query(&format!("CREATE TABLE {table} ({})", columns.join(", ")))
                .execute(&mut *tx)
                .await
                .map_err(&on_lock)?;
            change.created = true;
        } else {
            let current = |column: &str| {
                existing
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, data_type)| ColumnType::from_sql_type(data_type))
            };

            let missing_metadata: Vec<MetadataColumn> = request
                .metadata
                .iter()
                .copied()
                .filter(|m| current(m.name()).is_none())
                .collect();
            for column in missing_metadata {
                sqlx::query(&format!(
                    "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                    quote_ident(column.name()),
                    column.sql_type()
                ))
                .execute(&mut *tx)
                .await
                .map_err(&on_lock)?;
            }

            for spec in request.columns {
                let column = quote_ident(&spec.name);
                match current(&spec.name) {
                    None => {
                        sqlx::query(&format!(
                            "ALTER TABLE {table} ADD COLUMN {column} {}",
                            spec.column_type.sql_type()
                        ))
                        .execute(&mut *tx)
                        .await
                        .map_err(&on_lock)?;
                        change.added.push(spec.name.clone());
                    },
                    Some(existing_type) => {
                        let widened = existing_type.widen(spec.column_type);
                        if widened != existing_type {
                            let sql_type = widened.sql_type();
                            sqlx::query(&format!(
                                "ALTER TABLE {table} ALTER COLUMN {column} TYPE {sql_type} USING {column}::{sql_type}"
                            ))
                            .execute(&mut *tx)
                            .await
                            .map_err(&on_lock)?;
                            change.widened.push(spec.name.clone());
                        }
                    },
                }
            }
        }

        tx.commit().await?;
        Ok(change)
    }

    async fn existing_ranges(&self, query: &RangeQuery<'_>) -> IngestResult<Vec<ExistingRecord>> {
        let table = qualified_table(query.table)?;
        if !self.table_exists(query.table).await? {
            return Ok(Vec::new());
        }

        let select = |keys: &[Vec<Option<String>>]| {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
            query_builder.push(format!(
                "{}::bigint AS record_id, {}::text AS range_start, ",
                quote_ident(query.record_id_column),
                quote_ident(query.start_column)
            ));
            match query.end_column {
                Some(end) => query_builder.push(format!("{}::text AS range_end", quote_ident(end))),
                None => query_builder.push("NULL::text AS range_end"),
            };
            for (i, column) in query.key_columns.iter().enumerate() {
                query_builder.push(format!(", {}::text AS key_{i}", quote_ident(column)));
            }
            query_builder.push(format!(" FROM {table}"));

            if !query.key_columns.is_empty() {
                push_key_filter(&mut query_builder, query.key_columns, keys);
            }
            query_builder
        };

        let chunks: Vec<&[Vec<Option<String>>]> = if query.key_columns.is_empty() {
            vec![&query.keys[..0]]
        } else {
            query.keys.chunks(KEY_CHUNK_SIZE).collect()
        };

        let mut records = Vec::new();
        for keys in chunks {
            let rows = select(keys).build().fetch_all(&*self.pool).await?;
            for row in rows {
                let key = (0..query.key_columns.len())
                    .map(|i| row.try_get::<Option<String>, _>(format!("key_{i}").as_str()))
                    .collect::<Result<Vec<_>, _>>()?;
                records.push(ExistingRecord {
                    record_id: row.try_get("record_id")?,
                    key,
                    start: row.try_get("range_start")?,
                    end: row.try_get("range_end")?,
                });
            }
        }

        Ok(records)
    }

    async fn commit_normalized(&self, commit: &NormalizedCommit<'_>) -> IngestResult<CommitReport> {
        let staging = qualified_table(commit.staging_table)?;
        let normalized = qualified_table(commit.normalized_table)?;
        let mut report = CommitReport::default();

        let mut tx = self.pool.begin().await?;

        // Row locks taken here keep a concurrent run off the same snapshot
        report.processed = sqlx::query(&format!(
            "UPDATE {staging} SET processed_at = NOW() WHERE id = ANY($1) AND processed_at IS NULL"
        ))
        .bind(commit.processed)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if report.processed != commit.processed.len() as u64 {
            tx.rollback().await?;
            return Err(IngestError::IntegrityError(format!(
                "{} of {} staged rows in {} were already processed",
                commit.processed.len() as u64 - report.processed,
                commit.processed.len(),
                commit.staging_table
            )));
        }

        if let Some(supersede) = commit.supersede.filter(|s| !s.record_ids.is_empty()) {
            report.superseded = sqlx::query(&format!(
                "DELETE FROM {} WHERE {}::bigint = ANY($1)",
                qualified_table(supersede.table)?,
                quote_ident(supersede.record_id_column)
            ))
            .bind(supersede.record_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        let column_list = commit
            .metadata
            .iter()
            .map(|m| quote_ident(m.name()))
            .chain(commit.columns.iter().map(|c| quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");

        for chunk in commit.rows.chunks(STAGING_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {normalized} ({column_list}) "));
            query_builder.push_values(chunk, |mut b, row| {
                for column in commit.metadata {
                    match column {
                        MetadataColumn::RawId => b.push_bind(row.raw_id),
                        MetadataColumn::JobId => b.push_bind(commit.job_id),
                        MetadataColumn::FileHash => b.push_bind(&row.file_hash),
                        MetadataColumn::BatchId => b.push_bind(&row.batch_id),
                        MetadataColumn::SourceYear => b.push_bind(row.source_year),
                        MetadataColumn::IngestedAt => b.push_bind(row.ingested_at),
                    };
                }
                for (spec, value) in commit.columns.iter().zip(&row.values) {
                    b.push_bind(value.as_deref())
                        .push_unseparated(format!("::{}", spec.column_type.sql_type()));
                }
            });
            report.inserted += query_builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            table = commit.normalized_table,
            inserted = report.inserted,
            superseded = report.superseded,
            processed = report.processed,
            "Normalized rows committed"
        );

        Ok(report)
    }
}

/// ` WHERE (k1 = $1 AND k2 = $2) OR (...)` with NULL matching NULL
fn push_key_filter(
    query_builder: &mut QueryBuilder<'_, Postgres>,
    key_columns: &[String],
    keys: &[Vec<Option<String>>],
) {
    query_builder.push(" WHERE ");
    for (n, key) in keys.iter().enumerate() {
        if n > 0 {
            query_builder.push(" OR ");
        }
        query_builder.push("(");
        for (i, (column, value)) in key_columns.iter().zip(key).enumerate() {
            if i > 0 {
                query_builder.push(" AND ");
            }
            query_builder.push(format!("{}::text IS NOT DISTINCT FROM ", quote_ident(column)));
            query_builder.push_bind(value.clone());
        }
        query_builder.push(")");
    }
}
