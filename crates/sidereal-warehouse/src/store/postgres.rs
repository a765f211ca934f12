//! PostgreSQL warehouse store implementation.
//!
//! Table names for attribute storage are derived from [`AttributeContext`]
//! and [`ValueType`], both closed enums, so every dynamically formatted
//! statement targets a fixed, known set of tables.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::error::{WarehouseError, WarehouseResult};
use crate::identity::IdentityHash;
use crate::model::{
    AttributeKeyRecord, AttributeWriteSet, DataPointRow, FactCounts, FactId, KeyId, LogRow,
    MetricId, MetricRecord, MetricType, NewMetric, NewResource, NewScope, Observed, ResourceId,
    ResourceRecord, ScopeId, ScopeRecord, SpanEventRow, SpanLinkRow, SpanRow, StoredAttributes,
    Temporality, SEVERITY_LEVELS, SPAN_KINDS, STATUS_CODES,
};
use crate::signal::AttributeContext;
use crate::value::{AttributeValue, ValueType};

use super::{FactTransaction, WarehouseStore};

/// PostgreSQL-backed warehouse store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> WarehouseResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!(max_connections, "Connected to PostgreSQL warehouse store");
        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> WarehouseResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist and the reference tables are seeded.
    async fn ensure_schema(&self) -> WarehouseResult<()> {
        for statement in DIMENSION_SCHEMA.iter().chain(FACT_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for context in AttributeContext::ALL {
            for value_type in ValueType::ALL {
                let table = typed_table(context, value_type);
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        parent_id BIGINT NOT NULL,
                        key_id INTEGER NOT NULL REFERENCES attribute_keys (key_id),
                        value {sql_type} NOT NULL,
                        PRIMARY KEY (parent_id, key_id)
                    )
                    "#,
                    sql_type = value_type.sql_type(),
                ))
                .execute(&self.pool)
                .await?;

                if value_type != ValueType::Bytes {
                    sqlx::query(&format!(
                        "CREATE INDEX IF NOT EXISTS idx_{table}_key_value ON {table} (key_id, value)"
                    ))
                    .execute(&self.pool)
                    .await?;
                }
            }

            let table = catch_all_table(context);
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    parent_id BIGINT PRIMARY KEY,
                    attributes JSONB NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_attributes ON {table} USING GIN (attributes)"
            ))
            .execute(&self.pool)
            .await?;
        }

        self.seed_reference_tables().await?;
        debug!("Warehouse schema ensured");
        Ok(())
    }

    async fn seed_reference_tables(&self) -> WarehouseResult<()> {
        let numbered: [(&str, &str, &[(i16, &str)]); 3] = [
            ("severity_levels", "severity_number", &SEVERITY_LEVELS),
            ("span_kinds", "kind", &SPAN_KINDS),
            ("status_codes", "code", &STATUS_CODES),
        ];
        for (table, column, rows) in numbered {
            let mut qb =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} ({column}, name) "));
            qb.push_values(rows, |mut b, (number, name)| {
                b.push_bind(*number).push_bind(*name);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().execute(&self.pool).await?;
        }

        let named: [(&str, Vec<&str>); 2] = [
            (
                "metric_types",
                MetricType::ALL.iter().map(MetricType::as_str).collect(),
            ),
            (
                "aggregation_temporalities",
                Temporality::ALL.iter().map(Temporality::as_str).collect(),
            ),
        ];
        for (table, names) in named {
            let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (name) "));
            qb.push_values(names, |mut b, name| {
                b.push_bind(name);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_key(row: &PgRow) -> WarehouseResult<AttributeKeyRecord> {
        let declared: String = row.try_get("declared_type")?;
        Ok(AttributeKeyRecord {
            key_id: KeyId(row.try_get("key_id")?),
            key: row.try_get("key")?,
            declared_type: declared.parse().map_err(WarehouseError::Serialisation)?,
            searchable: row.try_get("searchable")?,
        })
    }

    fn row_to_resource(row: &PgRow) -> WarehouseResult<ResourceRecord> {
        Ok(ResourceRecord {
            id: ResourceId(row.try_get("resource_id")?),
            hash: parse_hash(row, "resource_hash")?,
            service_name: row.try_get("service_name")?,
            service_namespace: row.try_get("service_namespace")?,
            schema_url: row.try_get("schema_url")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            dropped_attribute_count: from_i64(row.try_get("dropped_attribute_count")?),
        })
    }

    fn row_to_scope(row: &PgRow) -> WarehouseResult<ScopeRecord> {
        Ok(ScopeRecord {
            id: ScopeId(row.try_get("scope_id")?),
            hash: parse_hash(row, "scope_hash")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            schema_url: row.try_get("schema_url")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            dropped_attribute_count: from_i64(row.try_get("dropped_attribute_count")?),
        })
    }

    fn row_to_metric(row: &PgRow) -> WarehouseResult<MetricRecord> {
        let metric_type: String = row.try_get("metric_type")?;
        let temporality: String = row.try_get("temporality")?;
        Ok(MetricRecord {
            id: MetricId(row.try_get("metric_id")?),
            metric_hash: parse_hash(row, "metric_hash")?,
            identity_hash: parse_hash(row, "metric_identity_hash")?,
            name: row.try_get("name")?,
            metric_type: metric_type.parse().map_err(WarehouseError::Serialisation)?,
            unit: row.try_get("unit")?,
            temporality: temporality.parse().map_err(WarehouseError::Serialisation)?,
            is_monotonic: row.try_get("is_monotonic")?,
            description: row.try_get("description")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
        })
    }

    fn row_to_observed<Id>(row: &PgRow, id: impl FnOnce(i64) -> Id) -> WarehouseResult<Observed<Id>> {
        Ok(Observed {
            id: id(row.try_get("id")?),
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            created: row.try_get("created")?,
        })
    }
}

#[async_trait]
impl WarehouseStore for PostgresStore {
    async fn upsert_attribute_key(
        &self,
        key: &str,
        declared_type: ValueType,
        searchable: bool,
    ) -> WarehouseResult<AttributeKeyRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO attribute_keys (key, declared_type, searchable)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET searchable = attribute_keys.searchable OR EXCLUDED.searchable
            RETURNING key_id, key, declared_type, searchable
            "#,
        )
        .bind(key)
        .bind(declared_type.as_str())
        .bind(searchable)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_key(&row)
    }

    async fn attribute_key(&self, key: &str) -> WarehouseResult<Option<AttributeKeyRecord>> {
        let row = sqlx::query(
            "SELECT key_id, key, declared_type, searchable FROM attribute_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_key).transpose()
    }

    async fn upsert_resource(
        &self,
        resource: &NewResource,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ResourceId>> {
        let row = sqlx::query(
            r#"
            INSERT INTO resources (
                resource_hash, service_name, service_namespace, schema_url,
                first_seen, last_seen, dropped_attribute_count
            )
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            ON CONFLICT (resource_hash) DO UPDATE
            SET last_seen = GREATEST(resources.last_seen, EXCLUDED.last_seen)
            RETURNING resource_id AS id, first_seen, last_seen, (xmax = 0) AS created
            "#,
        )
        .bind(resource.hash.to_hex())
        .bind(&resource.service_name)
        .bind(&resource.service_namespace)
        .bind(&resource.schema_url)
        .bind(seen_at)
        .bind(i64::from(resource.dropped_attribute_count))
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_observed(&row, ResourceId)
    }

    async fn touch_resource(&self, id: ResourceId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        sqlx::query(
            "UPDATE resources SET last_seen = GREATEST(last_seen, $2) WHERE resource_id = $1",
        )
        .bind(id.0)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_scope(
        &self,
        scope: &NewScope,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ScopeId>> {
        let row = sqlx::query(
            r#"
            INSERT INTO scopes (
                scope_hash, name, version, schema_url,
                first_seen, last_seen, dropped_attribute_count
            )
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            ON CONFLICT (scope_hash) DO UPDATE
            SET last_seen = GREATEST(scopes.last_seen, EXCLUDED.last_seen)
            RETURNING scope_id AS id, first_seen, last_seen, (xmax = 0) AS created
            "#,
        )
        .bind(scope.hash.to_hex())
        .bind(&scope.name)
        .bind(&scope.version)
        .bind(&scope.schema_url)
        .bind(seen_at)
        .bind(i64::from(scope.dropped_attribute_count))
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_observed(&row, ScopeId)
    }

    async fn touch_scope(&self, id: ScopeId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        sqlx::query("UPDATE scopes SET last_seen = GREATEST(last_seen, $2) WHERE scope_id = $1")
            .bind(id.0)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_metric(
        &self,
        metric: &NewMetric,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<MetricId>> {
        let row = sqlx::query(
            r#"
            INSERT INTO metrics (
                metric_hash, metric_identity_hash, name, metric_type, unit,
                temporality, is_monotonic, description, first_seen, last_seen
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (metric_hash) DO UPDATE
            SET last_seen = GREATEST(metrics.last_seen, EXCLUDED.last_seen)
            RETURNING metric_id AS id, first_seen, last_seen, (xmax = 0) AS created
            "#,
        )
        .bind(metric.metric_hash.to_hex())
        .bind(metric.identity_hash.to_hex())
        .bind(&metric.name)
        .bind(metric.metric_type.as_str())
        .bind(&metric.unit)
        .bind(metric.temporality.as_str())
        .bind(metric.is_monotonic)
        .bind(&metric.description)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_observed(&row, MetricId)
    }

    async fn touch_metric(&self, id: MetricId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        sqlx::query("UPDATE metrics SET last_seen = GREATEST(last_seen, $2) WHERE metric_id = $1")
            .bind(id.0)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()> {
        let mut tx = self.pool.begin().await?;
        write_attribute_set(&mut tx, context, parent_id, attributes, true).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn begin(&self) -> WarehouseResult<Box<dyn FactTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgFactTransaction { tx }))
    }

    async fn get_resource(&self, id: ResourceId) -> WarehouseResult<Option<ResourceRecord>> {
        let row = sqlx::query(
            r#"
            SELECT resource_id, resource_hash, service_name, service_namespace, schema_url,
                   first_seen, last_seen, dropped_attribute_count
            FROM resources
            WHERE resource_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn get_scope(&self, id: ScopeId) -> WarehouseResult<Option<ScopeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT scope_id, scope_hash, name, version, schema_url,
                   first_seen, last_seen, dropped_attribute_count
            FROM scopes
            WHERE scope_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_scope).transpose()
    }

    async fn get_metric(&self, id: MetricId) -> WarehouseResult<Option<MetricRecord>> {
        let row = sqlx::query(
            r#"
            SELECT metric_id, metric_hash, metric_identity_hash, name, metric_type, unit,
                   temporality, is_monotonic, description, first_seen, last_seen
            FROM metrics
            WHERE metric_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_metric).transpose()
    }

    async fn list_metric_variants(
        &self,
        identity_hash: &IdentityHash,
    ) -> WarehouseResult<Vec<MetricId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT metric_id FROM metrics WHERE metric_identity_hash = $1 ORDER BY metric_id",
        )
        .bind(identity_hash.to_hex())
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(MetricId).collect())
    }

    async fn load_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
    ) -> WarehouseResult<StoredAttributes> {
        let mut typed = Vec::new();
        for value_type in ValueType::ALL {
            let table = typed_table(context, value_type);
            let rows = sqlx::query(&format!(
                r#"
                SELECT k.key, t.value
                FROM {table} t
                JOIN attribute_keys k ON k.key_id = t.key_id
                WHERE t.parent_id = $1
                "#
            ))
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let key: String = row.try_get("key")?;
                let value = match value_type {
                    ValueType::String => AttributeValue::String(row.try_get("value")?),
                    ValueType::Int => AttributeValue::Int(row.try_get("value")?),
                    ValueType::Double => AttributeValue::Double(row.try_get("value")?),
                    ValueType::Bool => AttributeValue::Bool(row.try_get("value")?),
                    ValueType::Bytes => AttributeValue::Bytes(row.try_get("value")?),
                };
                typed.push((key, value));
            }
        }
        typed.sort_by(|a, b| a.0.cmp(&b.0));

        let table = catch_all_table(context);
        let document: Option<serde_json::Value> =
            sqlx::query_scalar(&format!("SELECT attributes FROM {table} WHERE parent_id = $1"))
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await?;

        let catch_all = match document {
            None => None,
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(WarehouseError::Serialisation(format!(
                    "catch-all attributes for {context} {parent_id} are not an object: {other}"
                )))
            }
        };

        Ok(StoredAttributes { typed, catch_all })
    }

    async fn fact_counts(&self) -> WarehouseResult<FactCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM log_records) AS logs,
                (SELECT COUNT(*) FROM spans) AS spans,
                (SELECT COUNT(*) FROM span_events) AS span_events,
                (SELECT COUNT(*) FROM span_links) AS span_links,
                (SELECT COUNT(*) FROM metric_data_points) AS data_points
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> WarehouseResult<u64> {
            let n: i64 = row.try_get(column)?;
            Ok(u64::try_from(n).unwrap_or(0))
        };
        Ok(FactCounts {
            logs: count("logs")?,
            spans: count("spans")?,
            span_events: count("span_events")?,
            span_links: count("span_links")?,
            data_points: count("data_points")?,
        })
    }
}

/// A fact transaction holding one pooled connection until commit.
struct PgFactTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl FactTransaction for PgFactTransaction {
    async fn insert_log(&mut self, row: &LogRow) -> WarehouseResult<FactId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO log_records (
                resource_id, scope_id, time_unix_nano, observed_time_unix_nano,
                severity_number, severity_text, body, trace_id, span_id,
                flags, dropped_attributes_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING log_id
            "#,
        )
        .bind(row.resource_id.0)
        .bind(row.scope_id.map(|s| s.0))
        .bind(to_i64(row.time_unix_nano))
        .bind(to_i64(row.observed_time_unix_nano))
        .bind(row.severity_number)
        .bind(&row.severity_text)
        .bind(&row.body)
        .bind(&row.trace_id)
        .bind(&row.span_id)
        .bind(i64::from(row.flags))
        .bind(i64::from(row.dropped_attributes_count))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(FactId(id))
    }

    async fn insert_span(&mut self, row: &SpanRow) -> WarehouseResult<FactId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO spans (
                resource_id, scope_id, trace_id, span_id, parent_span_id, trace_state,
                name, kind, start_time_unix_nano, end_time_unix_nano,
                status_code, status_message, flags,
                dropped_attributes_count, dropped_events_count, dropped_links_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING span_row_id
            "#,
        )
        .bind(row.resource_id.0)
        .bind(row.scope_id.map(|s| s.0))
        .bind(&row.trace_id)
        .bind(&row.span_id)
        .bind(&row.parent_span_id)
        .bind(&row.trace_state)
        .bind(&row.name)
        .bind(row.kind)
        .bind(to_i64(row.start_time_unix_nano))
        .bind(to_i64(row.end_time_unix_nano))
        .bind(row.status_code)
        .bind(&row.status_message)
        .bind(i64::from(row.flags))
        .bind(i64::from(row.dropped_attributes_count))
        .bind(i64::from(row.dropped_events_count))
        .bind(i64::from(row.dropped_links_count))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(FactId(id))
    }

    async fn insert_span_event(&mut self, row: &SpanEventRow) -> WarehouseResult<FactId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO span_events (span_row_id, time_unix_nano, name, dropped_attributes_count)
            VALUES ($1, $2, $3, $4)
            RETURNING event_id
            "#,
        )
        .bind(row.span_row_id.0)
        .bind(to_i64(row.time_unix_nano))
        .bind(&row.name)
        .bind(i64::from(row.dropped_attributes_count))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(FactId(id))
    }

    async fn insert_span_link(&mut self, row: &SpanLinkRow) -> WarehouseResult<FactId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO span_links (
                span_row_id, linked_trace_id, linked_span_id, trace_state,
                flags, dropped_attributes_count
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING link_id
            "#,
        )
        .bind(row.span_row_id.0)
        .bind(&row.trace_id)
        .bind(&row.span_id)
        .bind(&row.trace_state)
        .bind(i64::from(row.flags))
        .bind(i64::from(row.dropped_attributes_count))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(FactId(id))
    }

    async fn insert_data_point(&mut self, row: &DataPointRow) -> WarehouseResult<FactId> {
        let distribution = row.value.distribution()?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO metric_data_points (
                metric_id, resource_id, scope_id, start_time_unix_nano, time_unix_nano,
                flags, kind, value_double, value_int, distribution, exemplar_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING data_point_id
            "#,
        )
        .bind(row.metric_id.0)
        .bind(row.resource_id.0)
        .bind(row.scope_id.map(|s| s.0))
        .bind(row.start_time_unix_nano.map(to_i64))
        .bind(to_i64(row.time_unix_nano))
        .bind(i64::from(row.flags))
        .bind(row.value.kind())
        .bind(row.value.as_double())
        .bind(row.value.as_int())
        .bind(distribution)
        .bind(i64::from(row.exemplar_count))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(FactId(id))
    }

    async fn write_attributes(
        &mut self,
        context: AttributeContext,
        parent_id: FactId,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()> {
        write_attribute_set(&mut self.tx, context, parent_id.0, attributes, false).await
    }

    async fn commit(self: Box<Self>) -> WarehouseResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> WarehouseResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Write one parent's attributes on an open connection.
///
/// With `replace`, typed rows for keys absent from `attributes` are deleted
/// and an empty catch-all removes the existing document.
async fn write_attribute_set(
    conn: &mut PgConnection,
    context: AttributeContext,
    parent_id: i64,
    attributes: &AttributeWriteSet,
    replace: bool,
) -> WarehouseResult<()> {
    if replace {
        let keep: [(ValueType, Vec<i32>); 5] = [
            (ValueType::String, key_ids(&attributes.strings)),
            (ValueType::Int, key_ids(&attributes.ints)),
            (ValueType::Double, key_ids(&attributes.doubles)),
            (ValueType::Bool, key_ids(&attributes.bools)),
            (ValueType::Bytes, key_ids(&attributes.bytes)),
        ];
        for (value_type, ids) in keep {
            let table = typed_table(context, value_type);
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE parent_id = $1 AND NOT (key_id = ANY($2))"
            ))
            .bind(parent_id)
            .bind(ids)
            .execute(&mut *conn)
            .await?;
        }
    }

    upsert_typed(conn, context, ValueType::String, parent_id, &attributes.strings).await?;
    upsert_typed(conn, context, ValueType::Int, parent_id, &attributes.ints).await?;
    upsert_typed(conn, context, ValueType::Double, parent_id, &attributes.doubles).await?;
    upsert_typed(conn, context, ValueType::Bool, parent_id, &attributes.bools).await?;
    upsert_typed(conn, context, ValueType::Bytes, parent_id, &attributes.bytes).await?;

    let table = catch_all_table(context);
    if !attributes.catch_all.is_empty() {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (parent_id, attributes)
            VALUES ($1, $2)
            ON CONFLICT (parent_id) DO UPDATE SET attributes = EXCLUDED.attributes
            "#
        ))
        .bind(parent_id)
        .bind(serde_json::Value::Object(attributes.catch_all.clone()))
        .execute(&mut *conn)
        .await?;
    } else if replace {
        sqlx::query(&format!("DELETE FROM {table} WHERE parent_id = $1"))
            .bind(parent_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// Batched upsert of one typed table's rows for a parent.
async fn upsert_typed<T>(
    conn: &mut PgConnection,
    context: AttributeContext,
    value_type: ValueType,
    parent_id: i64,
    rows: &[(KeyId, T)],
) -> WarehouseResult<()>
where
    T: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Clone + Send + Sync + 'static,
{
    if rows.is_empty() {
        return Ok(());
    }

    let table = typed_table(context, value_type);
    let mut qb =
        QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (parent_id, key_id, value) "));
    qb.push_values(rows, |mut b, (key_id, value)| {
        b.push_bind(parent_id)
            .push_bind(key_id.0)
            .push_bind(value.clone());
    });
    qb.push(" ON CONFLICT (parent_id, key_id) DO UPDATE SET value = EXCLUDED.value");
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

fn typed_table(context: AttributeContext, value_type: ValueType) -> String {
    format!("{}_attrs_{}", context.as_str(), value_type.as_str())
}

fn catch_all_table(context: AttributeContext) -> String {
    format!("{}_attrs_other", context.as_str())
}

fn key_ids<T>(rows: &[(KeyId, T)]) -> Vec<i32> {
    rows.iter().map(|(id, _)| id.0).collect()
}

fn parse_hash(row: &PgRow, column: &str) -> WarehouseResult<IdentityHash> {
    let hex: String = row.try_get(column)?;
    IdentityHash::from_hex(&hex)
        .ok_or_else(|| WarehouseError::Serialisation(format!("invalid {column} '{hex}'")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

const DIMENSION_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS attribute_keys (
        key_id SERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        declared_type TEXT NOT NULL,
        searchable BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        resource_id BIGSERIAL PRIMARY KEY,
        resource_hash TEXT NOT NULL UNIQUE,
        service_name TEXT,
        service_namespace TEXT,
        schema_url TEXT,
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        dropped_attribute_count BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_resources_service_name ON resources (service_name)",
    r#"
    CREATE TABLE IF NOT EXISTS scopes (
        scope_id BIGSERIAL PRIMARY KEY,
        scope_hash TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        version TEXT,
        schema_url TEXT,
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        dropped_attribute_count BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        metric_id BIGSERIAL PRIMARY KEY,
        metric_hash TEXT NOT NULL UNIQUE,
        metric_identity_hash TEXT NOT NULL,
        name TEXT NOT NULL,
        metric_type TEXT NOT NULL,
        unit TEXT,
        temporality TEXT NOT NULL,
        is_monotonic BOOLEAN NOT NULL,
        description TEXT,
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_identity_hash ON metrics (metric_identity_hash)",
    "CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics (name)",
    r#"
    CREATE TABLE IF NOT EXISTS severity_levels (
        severity_number SMALLINT PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS span_kinds (
        kind SMALLINT PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS status_codes (
        code SMALLINT PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    "CREATE TABLE IF NOT EXISTS metric_types (name TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS aggregation_temporalities (name TEXT PRIMARY KEY)",
];

const FACT_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS log_records (
        log_id BIGSERIAL PRIMARY KEY,
        resource_id BIGINT NOT NULL REFERENCES resources (resource_id),
        scope_id BIGINT REFERENCES scopes (scope_id),
        time_unix_nano BIGINT NOT NULL,
        observed_time_unix_nano BIGINT NOT NULL,
        severity_number SMALLINT NOT NULL,
        severity_text TEXT,
        body JSONB,
        trace_id TEXT,
        span_id TEXT,
        flags BIGINT NOT NULL,
        dropped_attributes_count BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_log_records_time ON log_records (time_unix_nano DESC)",
    "CREATE INDEX IF NOT EXISTS idx_log_records_trace ON log_records (trace_id)",
    r#"
    CREATE TABLE IF NOT EXISTS spans (
        span_row_id BIGSERIAL PRIMARY KEY,
        resource_id BIGINT NOT NULL REFERENCES resources (resource_id),
        scope_id BIGINT REFERENCES scopes (scope_id),
        trace_id TEXT NOT NULL,
        span_id TEXT NOT NULL,
        parent_span_id TEXT,
        trace_state TEXT,
        name TEXT NOT NULL,
        kind SMALLINT NOT NULL,
        start_time_unix_nano BIGINT NOT NULL,
        end_time_unix_nano BIGINT NOT NULL,
        status_code SMALLINT NOT NULL,
        status_message TEXT,
        flags BIGINT NOT NULL,
        dropped_attributes_count BIGINT NOT NULL,
        dropped_events_count BIGINT NOT NULL,
        dropped_links_count BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans (trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_spans_start ON spans (start_time_unix_nano DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS span_events (
        event_id BIGSERIAL PRIMARY KEY,
        span_row_id BIGINT NOT NULL REFERENCES spans (span_row_id) ON DELETE CASCADE,
        time_unix_nano BIGINT NOT NULL,
        name TEXT NOT NULL,
        dropped_attributes_count BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS span_links (
        link_id BIGSERIAL PRIMARY KEY,
        span_row_id BIGINT NOT NULL REFERENCES spans (span_row_id) ON DELETE CASCADE,
        linked_trace_id TEXT NOT NULL,
        linked_span_id TEXT NOT NULL,
        trace_state TEXT,
        flags BIGINT NOT NULL,
        dropped_attributes_count BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metric_data_points (
        data_point_id BIGSERIAL PRIMARY KEY,
        metric_id BIGINT NOT NULL REFERENCES metrics (metric_id),
        resource_id BIGINT NOT NULL REFERENCES resources (resource_id),
        scope_id BIGINT REFERENCES scopes (scope_id),
        start_time_unix_nano BIGINT,
        time_unix_nano BIGINT NOT NULL,
        flags BIGINT NOT NULL,
        kind TEXT NOT NULL,
        value_double DOUBLE PRECISION,
        value_int BIGINT,
        distribution JSONB,
        exemplar_count BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metric_data_points_metric_time ON metric_data_points (metric_id, time_unix_nano DESC)",
];

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PostgresStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PostgresStore::connect(&url, 5, Duration::from_secs(30))
            .await
            .expect("failed to connect")
    }

    fn unique(name: &str) -> String {
        format!("{name}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[test]
    fn table_names() {
        assert_eq!(
            typed_table(AttributeContext::SpanEvent, ValueType::Double),
            "span_event_attrs_double"
        );
        assert_eq!(catch_all_table(AttributeContext::DataPoint), "data_point_attrs_other");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn upsert_resource_converges() {
        let store = store().await;
        let attrs = vec![crate::value::Attribute::new(
            "service.name",
            AttributeValue::String(unique("svc")),
        )];
        let resource = NewResource {
            hash: crate::identity::resource_hash(&attrs, None),
            service_name: attrs[0].value.as_str().map(ToOwned::to_owned),
            service_namespace: None,
            schema_url: None,
            dropped_attribute_count: 0,
        };

        let t0 = Utc::now();
        let first = store.upsert_resource(&resource, t0).await.unwrap();
        let second = store
            .upsert_resource(&resource, t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(first.first_seen, second.first_seen);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn key_searchable_is_or_merged() {
        let store = store().await;
        let key = unique("tenant.id");
        let a = store
            .upsert_attribute_key(&key, ValueType::String, true)
            .await
            .unwrap();
        let b = store
            .upsert_attribute_key(&key, ValueType::Int, false)
            .await
            .unwrap();
        assert_eq!(a.key_id, b.key_id);
        assert!(b.searchable);
        assert_eq!(b.declared_type, ValueType::String);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn rollback_discards_facts() {
        let store = store().await;
        let before = store.fact_counts().await.unwrap();

        let attrs = vec![crate::value::Attribute::new(
            "service.name",
            AttributeValue::String(unique("rollback")),
        )];
        let resource = store
            .upsert_resource(
                &NewResource {
                    hash: crate::identity::resource_hash(&attrs, None),
                    service_name: None,
                    service_namespace: None,
                    schema_url: None,
                    dropped_attribute_count: 0,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_log(&LogRow {
            resource_id: resource.id,
            scope_id: None,
            time_unix_nano: 1,
            observed_time_unix_nano: 1,
            severity_number: 9,
            severity_text: Some("INFO".into()),
            body: None,
            trace_id: None,
            span_id: None,
            flags: 0,
            dropped_attributes_count: 0,
        })
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.fact_counts().await.unwrap().logs, before.logs);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn nul_in_otlp_text_is_stored_replaced() {
        use std::sync::Arc;

        use crate::config::CacheConfig;
        use crate::policy::PolicyHandle;
        use crate::test_fixtures::{kv, log_request};
        use crate::warehouse::Warehouse;
        use opentelemetry_proto::tonic::common::v1::{any_value::Value, AnyValue};
        use opentelemetry_proto::tonic::resource::v1::Resource;

        let store: Arc<dyn WarehouseStore> = Arc::new(store().await);
        let policy = Arc::new(PolicyHandle::new(None).unwrap());
        let warehouse = Warehouse::with_store(Arc::clone(&store), policy, &CacheConfig::default());

        let service = unique("nul\0svc");
        let resource = Resource {
            attributes: vec![
                kv("service.name", Value::StringValue(service.clone())),
                kv("deploy.note", Value::StringValue("a\0b".into())),
            ],
            ..Default::default()
        };
        let mut request = log_request(resource.clone(), 1);
        let scope_logs = &mut request.resource_logs[0].scope_logs[0];
        if let Some(scope) = scope_logs.scope.as_mut() {
            scope.name = "scope\0name".into();
        }
        let record = &mut scope_logs.log_records[0];
        record.body = Some(AnyValue {
            value: Some(Value::StringValue("a\0b".into())),
        });
        record.attributes = vec![
            kv("exception.message", Value::StringValue("a\0b".into())),
            kv("app.detail\0", Value::StringValue("a\0b".into())),
        ];

        assert_eq!(warehouse.logs().ingest(&request).await.unwrap(), 1);

        let resource_id = warehouse
            .managers()
            .resources
            .resolve(Some(&resource), "")
            .await
            .unwrap();
        let stored = store.get_resource(resource_id).await.unwrap().unwrap();
        assert_eq!(
            stored.service_name.as_deref(),
            Some(service.replace('\0', "\u{FFFD}").as_str())
        );

        let attributes = store
            .load_attributes(AttributeContext::Resource, resource_id.0)
            .await
            .unwrap();
        assert_eq!(
            attributes.catch_all.unwrap()["deploy.note"],
            serde_json::json!({"string": "a\u{FFFD}b"})
        );
    }
}
