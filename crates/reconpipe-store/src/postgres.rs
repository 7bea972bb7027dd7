//! Postgres-backed `Store` (spec.md §4.9). Grounded on
//! `rootsignal-archive/src/store.rs`'s `query_as`/`FromRow` idiom and
//! embedded-migration runner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reconpipe_common::domain::{
    ApexDomain, BatchStatus, DnsRecord, HistoricalUrlRecord, HttpProbeRecord, QueryParamValue,
    SubdomainRecord, UrlRecord,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    retry_with_backoff, DnsInsertOutcome, HttpProbeInsertOutcome, ProbeResolution, Store,
    StoreError, SubdomainInsertOutcome,
};

/// Rows are inserted in sub-batches of this size (spec.md §4.9).
const INSERT_BATCH_SIZE: usize = 500;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::new("connect_failed", e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::new("migration_failed", e.to_string()))?;
        Ok(())
    }
}

fn db_err(code: &str, e: sqlx::Error) -> StoreError {
    StoreError::new(code, e.to_string())
}

fn query_params_to_json(
    params: &BTreeMap<String, QueryParamValue>,
) -> serde_json::Value {
    serde_json::to_value(params).unwrap_or(serde_json::Value::Null)
}

fn query_params_from_json(value: serde_json::Value) -> BTreeMap<String, QueryParamValue> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_url_record(row: sqlx::postgres::PgRow) -> Result<UrlRecord, sqlx::Error> {
    let query_params: serde_json::Value = row.try_get("query_params")?;
    let sources: serde_json::Value = row.try_get("sources")?;
    let technologies: serde_json::Value = row.try_get("technologies")?;
    Ok(UrlRecord {
        id: row.try_get("id")?,
        asset_id: row.try_get("asset_id")?,
        canonical_url: row.try_get("canonical_url")?,
        url_hash: row.try_get("url_hash")?,
        domain: row.try_get("domain")?,
        path: row.try_get("path")?,
        query_params: query_params_from_json(query_params),
        sources: serde_json::from_value(sources).unwrap_or_default(),
        first_discovered_by: row.try_get("first_discovered_by")?,
        first_discovered_at: row.try_get("first_discovered_at")?,
        resolved_at: row.try_get("resolved_at")?,
        is_alive: row.try_get("is_alive")?,
        status_code: row
            .try_get::<Option<i32>, _>("status_code")?
            .map(|v| v as u16),
        content_type: row.try_get("content_type")?,
        content_length: row.try_get("content_length")?,
        response_time_ms: row.try_get("response_time_ms")?,
        title: row.try_get("title")?,
        final_url: row.try_get("final_url")?,
        redirect_chain: row.try_get("redirect_chain")?,
        server: row.try_get("server")?,
        technologies: serde_json::from_value(technologies).unwrap_or_default(),
        file_extension: row.try_get("file_extension")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn bulk_insert_dns(&self, records: &[DnsRecord]) -> crate::Result<DnsInsertOutcome> {
        let mut outcome = DnsInsertOutcome::default();
        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            for r in chunk {
                let result = sqlx::query(
                    r#"
                    INSERT INTO dns_records
                        (subdomain, parent_domain, record_type, value, ttl, mx_priority,
                         resolved_at, asset_id, scan_job_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (asset_id, subdomain, record_type, value)
                    DO UPDATE SET ttl = EXCLUDED.ttl, resolved_at = EXCLUDED.resolved_at
                    "#,
                )
                .bind(&r.subdomain)
                .bind(&r.parent_domain)
                .bind(r.record_type.to_string())
                .bind(&r.value)
                .bind(r.ttl)
                .bind(r.mx_priority)
                .bind(r.resolved_at)
                .bind(r.asset_id)
                .bind(r.scan_job_id)
                .execute(&self.pool)
                .await;

                match result {
                    Ok(res) => {
                        if res.rows_affected() > 0 {
                            outcome.inserted += 1;
                        } else {
                            outcome.skipped += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(subdomain = %r.subdomain, error = %e, "dns insert failed");
                        outcome.errored += 1;
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_subdomains(
        &self,
        records: &[SubdomainRecord],
    ) -> crate::Result<SubdomainInsertOutcome> {
        let mut outcome = SubdomainInsertOutcome::default();
        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            for r in chunk {
                let result = sqlx::query(
                    r#"
                    INSERT INTO subdomains
                        (subdomain, parent_domain, source, discovered_at, asset_id, scan_job_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (asset_id, subdomain) DO NOTHING
                    "#,
                )
                .bind(&r.subdomain)
                .bind(&r.parent_domain)
                .bind(&r.source)
                .bind(r.discovered_at)
                .bind(r.asset_id)
                .bind(r.scan_job_id)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("insert_subdomain_failed", e))?;

                if result.rows_affected() > 0 {
                    outcome.inserted += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_http_probes(
        &self,
        probes: &[HttpProbeRecord],
    ) -> crate::Result<HttpProbeInsertOutcome> {
        let mut outcome = HttpProbeInsertOutcome::default();
        for chunk in probes.chunks(INSERT_BATCH_SIZE) {
            for p in chunk {
                let result = sqlx::query(
                    r#"
                    INSERT INTO http_probes
                        (url, subdomain, parent_domain, scheme, port, status_code, title,
                         server, content_type, content_length, final_url, ip, technologies,
                         cdn, asn, chain_status_codes, location, favicon_hash, created_at,
                         asset_id, scan_job_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17, $18, $19, $20, $21)
                    "#,
                )
                .bind(&p.url)
                .bind(&p.subdomain)
                .bind(&p.parent_domain)
                .bind(&p.scheme)
                .bind(p.port as i32)
                .bind(p.status_code.map(|v| v as i32))
                .bind(&p.title)
                .bind(&p.server)
                .bind(&p.content_type)
                .bind(p.content_length)
                .bind(&p.final_url)
                .bind(&p.ip)
                .bind(serde_json::to_value(&p.technologies).unwrap_or_default())
                .bind(&p.cdn)
                .bind(&p.asn)
                .bind(&p.chain_status_codes)
                .bind(&p.location)
                .bind(&p.favicon_hash)
                .bind(p.created_at)
                .bind(p.asset_id)
                .bind(p.scan_job_id)
                .execute(&self.pool)
                .await;

                match result {
                    Ok(_) => outcome.inserted += 1,
                    Err(e) => {
                        tracing::warn!(url = %p.url, error = %e, "http probe insert failed");
                        outcome.errored += 1;
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_historical_urls(
        &self,
        records: &[HistoricalUrlRecord],
    ) -> crate::Result<u64> {
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            for r in chunk {
                let result = sqlx::query(
                    r#"
                    INSERT INTO historical_urls
                        (url, parent_domain, source, asset_id, scan_job_id, discovered_at, metadata)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (asset_id, url) DO UPDATE SET
                        source = EXCLUDED.source,
                        metadata = EXCLUDED.metadata
                    "#,
                )
                .bind(&r.url)
                .bind(&r.parent_domain)
                .bind(&r.source)
                .bind(r.asset_id)
                .bind(r.scan_job_id)
                .bind(r.discovered_at)
                .bind(&r.metadata)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("insert_historical_url_failed", e))?;

                inserted += result.rows_affected();
            }
        }
        Ok(inserted)
    }

    async fn get_url_by_hash(
        &self,
        asset_id: Uuid,
        url_hash: &str,
    ) -> crate::Result<Option<UrlRecord>> {
        let row = sqlx::query(
            r#"SELECT * FROM urls WHERE asset_id = $1 AND url_hash = $2"#,
        )
        .bind(asset_id)
        .bind(url_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("get_url_failed", e))?;

        match row {
            Some(row) => Ok(Some(
                row_to_url_record(row).map_err(|e| db_err("decode_url_failed", e))?,
            )),
            None => Ok(None),
        }
    }

    async fn insert_url(&self, record: &UrlRecord) -> crate::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO urls
                (id, asset_id, canonical_url, url_hash, domain, path, query_params, sources,
                 first_discovered_by, first_discovered_at, resolved_at, is_alive, status_code,
                 content_type, content_length, response_time_ms, title, final_url,
                 redirect_chain, server, technologies, file_extension, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (asset_id, url_hash) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.asset_id)
        .bind(&record.canonical_url)
        .bind(&record.url_hash)
        .bind(&record.domain)
        .bind(&record.path)
        .bind(query_params_to_json(&record.query_params))
        .bind(serde_json::to_value(&record.sources).unwrap_or_default())
        .bind(&record.first_discovered_by)
        .bind(record.first_discovered_at)
        .bind(record.resolved_at)
        .bind(record.is_alive)
        .bind(record.status_code.map(|v| v as i32))
        .bind(&record.content_type)
        .bind(record.content_length)
        .bind(record.response_time_ms)
        .bind(&record.title)
        .bind(&record.final_url)
        .bind(&record.redirect_chain)
        .bind(&record.server)
        .bind(serde_json::to_value(&record.technologies).unwrap_or_default())
        .bind(&record.file_extension)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("insert_url_failed", e))?;
        Ok(())
    }

    async fn update_url_resolution(
        &self,
        asset_id: Uuid,
        url_hash: &str,
        probe: &ProbeResolution,
        optional_new_source: Option<&str>,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"
            UPDATE urls SET
                is_alive = $3,
                status_code = $4,
                content_type = $5,
                content_length = $6,
                response_time_ms = $7,
                title = $8,
                final_url = $9,
                redirect_chain = $10,
                server = $11,
                technologies = $12,
                resolved_at = now(),
                updated_at = now(),
                sources = CASE
                    WHEN $13::text IS NOT NULL AND NOT (sources ? $13)
                        THEN sources || to_jsonb(ARRAY[$13::text])
                    ELSE sources
                END
            WHERE asset_id = $1 AND url_hash = $2
            "#,
        )
        .bind(asset_id)
        .bind(url_hash)
        .bind(probe.is_alive)
        .bind(probe.status_code.map(|v| v as i32))
        .bind(&probe.content_type)
        .bind(probe.content_length)
        .bind(probe.response_time_ms)
        .bind(&probe.title)
        .bind(&probe.final_url)
        .bind(&probe.redirect_chain)
        .bind(&probe.server)
        .bind(serde_json::to_value(&probe.technologies).unwrap_or_default())
        .bind(optional_new_source)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update_url_resolution_failed", e))?;
        Ok(())
    }

    async fn add_source_to_url(
        &self,
        asset_id: Uuid,
        url_hash: &str,
        source: &str,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"
            UPDATE urls SET
                sources = CASE
                    WHEN NOT (sources ? $3) THEN sources || to_jsonb(ARRAY[$3::text])
                    ELSE sources
                END,
                updated_at = now()
            WHERE asset_id = $1 AND url_hash = $2
            "#,
        )
        .bind(asset_id)
        .bind(url_hash)
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("add_source_failed", e))?;
        Ok(())
    }

    async fn get_subdomains_for_asset(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> crate::Result<Vec<SubdomainRecord>> {
        let rows = sqlx::query_as::<_, SubdomainRow>(
            r#"
            SELECT subdomain, parent_domain, source, discovered_at, asset_id, scan_job_id
            FROM subdomains
            WHERE asset_id = $1
            ORDER BY subdomain
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(asset_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("get_subdomains_failed", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_apex_domains(&self, asset_id: Uuid) -> crate::Result<Vec<ApexDomain>> {
        let rows = sqlx::query_as::<_, ApexDomainRow>(
            r#"SELECT id, domain, active, asset_id FROM apex_domains WHERE asset_id = $1 AND active"#,
        )
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("fetch_apex_domains_failed", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        metadata: Option<serde_json::Value>,
    ) -> crate::Result<()> {
        retry_with_backoff(|| async {
            let completed_at = matches!(status, BatchStatus::Completed | BatchStatus::Failed)
                .then(Utc::now);
            sqlx::query(
                r#"
                UPDATE batch_jobs SET status = $2, metadata = $3, completed_at = $4
                WHERE id = $1
                "#,
            )
            .bind(batch_id)
            .bind(status.to_string())
            .bind(&metadata)
            .bind(completed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update_batch_status_failed", e))?;
            Ok(())
        })
        .await
    }

    async fn update_scan_job_status(
        &self,
        scan_job_id: Uuid,
        status: &str,
        metadata: Option<serde_json::Value>,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"UPDATE scan_jobs SET status = $2, metadata = $3, updated_at = now() WHERE id = $1"#,
        )
        .bind(scan_job_id)
        .bind(status)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update_scan_job_status_failed", e))?;
        Ok(())
    }

    async fn get_historical_urls_page(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> crate::Result<Vec<HistoricalUrlRecord>> {
        let rows = sqlx::query_as::<_, HistoricalUrlRow>(
            r#"
            SELECT url, parent_domain, source, asset_id, scan_job_id, discovered_at, metadata
            FROM historical_urls
            WHERE asset_id = $1
            ORDER BY url
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(asset_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("get_historical_urls_failed", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct SubdomainRow {
    subdomain: String,
    parent_domain: String,
    source: String,
    discovered_at: DateTime<Utc>,
    asset_id: Uuid,
    scan_job_id: Option<Uuid>,
}

impl From<SubdomainRow> for SubdomainRecord {
    fn from(r: SubdomainRow) -> Self {
        Self {
            subdomain: r.subdomain,
            parent_domain: r.parent_domain,
            source: r.source,
            discovered_at: r.discovered_at,
            asset_id: r.asset_id,
            scan_job_id: r.scan_job_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApexDomainRow {
    id: Uuid,
    domain: String,
    active: bool,
    asset_id: Uuid,
}

impl From<ApexDomainRow> for ApexDomain {
    fn from(r: ApexDomainRow) -> Self {
        Self {
            id: r.id,
            domain: r.domain,
            active: r.active,
            asset_id: r.asset_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoricalUrlRow {
    url: String,
    parent_domain: String,
    source: String,
    asset_id: Uuid,
    scan_job_id: Option<Uuid>,
    discovered_at: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
}

impl From<HistoricalUrlRow> for HistoricalUrlRecord {
    fn from(r: HistoricalUrlRow) -> Self {
        Self {
            url: r.url,
            parent_domain: r.parent_domain,
            source: r.source,
            asset_id: r.asset_id,
            scan_job_id: r.scan_job_id,
            discovered_at: r.discovered_at,
            metadata: r.metadata,
        }
    }
}
