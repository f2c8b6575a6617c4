//! Postgres-backed [`CrawlStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invcrawl_core::{
    dedupe_discovered, DataSource, DetailUpdate, DiscoveredItem, Item, PendingDetail, RunFinish,
    RunStatus, RunType, ScrapeRun, SiteProfile,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{CrawlStore, UpsertSummary};

#[derive(Debug, Clone)]
pub struct PgCrawlStore {
    pool: PgPool,
}

impl PgCrawlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running crawl migrations")?;
        Ok(())
    }
}

fn count_from(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn count_to(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn run_from_row(row: &PgRow) -> Result<ScrapeRun> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        data_source_id: row.try_get("data_source_id")?,
        run_type: RunType::parse(&run_type)
            .with_context(|| format!("unknown run_type {run_type}"))?,
        status: RunStatus::parse(&status).with_context(|| format!("unknown status {status}"))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        items_seen: count_from(row.try_get("items_seen")?),
        items_new: count_from(row.try_get("items_new")?),
        items_removed: count_from(row.try_get("items_removed")?),
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        data_source_id: row.try_get("data_source_id")?,
        source_item_id: row.try_get("source_item_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description_text: row.try_get("description_text")?,
        price_amount: row.try_get("price_amount")?,
        price_currency: row.try_get("price_currency")?,
        primary_image_url: row.try_get("primary_image_url")?,
        image_urls_json: row.try_get("image_urls_json")?,
        attributes_json: row.try_get("attributes_json")?,
        content_hash: row.try_get("content_hash")?,
        is_active: row.try_get("is_active")?,
        removed_at: row.try_get("removed_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_seen_run_id: row.try_get("last_seen_run_id")?,
        detail_fetched_at: row.try_get("detail_fetched_at")?,
        last_detail_run_id: row.try_get("last_detail_run_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CrawlStore for PgCrawlStore {
    async fn insert_data_source(&self, source: &DataSource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_sources (id, customer_id, base_url, config)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(source.id)
        .bind(source.customer_id)
        .bind(&source.base_url)
        .bind(&source.config)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting data source {}", source.id))?;
        Ok(())
    }

    async fn get_data_source(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
    ) -> Result<Option<DataSource>> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, base_url, config
              FROM data_sources
             WHERE id = $1 AND customer_id = $2
            "#,
        )
        .bind(data_source_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading data source {data_source_id}"))?;

        row.map(|row| -> Result<DataSource> {
            Ok(DataSource {
                id: row.try_get("id")?,
                customer_id: row.try_get("customer_id")?,
                base_url: row.try_get("base_url")?,
                config: row.try_get::<JsonValue, _>("config")?,
            })
        })
        .transpose()
    }

    async fn save_site_profile(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        profile: &SiteProfile,
    ) -> Result<bool> {
        let profile = serde_json::to_value(profile)?;
        let result = sqlx::query(
            r#"
            UPDATE data_sources
               SET config = jsonb_set(
                       CASE WHEN jsonb_typeof(config) = 'object' THEN config ELSE '{}'::jsonb END,
                       '{siteProfile}', $3, true)
             WHERE id = $1 AND customer_id = $2
            "#,
        )
        .bind(data_source_id)
        .bind(customer_id)
        .bind(profile)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving site profile for {data_source_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: &ScrapeRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs
                (id, customer_id, data_source_id, run_type, status, started_at, finished_at,
                 items_seen, items_new, items_removed, error_code, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.customer_id)
        .bind(run.data_source_id)
        .bind(run.run_type.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(count_to(run.items_seen))
        .bind(count_to(run.items_new))
        .bind(count_to(run.items_removed))
        .bind(&run.error_code)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("creating run {}", run.id))?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, data_source_id, run_type, status, started_at, finished_at,
                   items_seen, items_new, items_removed, error_code, error_message
              FROM scrape_runs
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading run {run_id}"))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = 'running', started_at = $2
             WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(run_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking run {run_id} running"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        finish: &RunFinish,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match finish {
            RunFinish::Success(counts) => sqlx::query(
                r#"
                UPDATE scrape_runs
                   SET status = 'success', finished_at = $2,
                       items_seen = $3, items_new = $4, items_removed = $5
                 WHERE id = $1 AND status NOT IN ('success', 'failed')
                "#,
            )
            .bind(run_id)
            .bind(finished_at)
            .bind(count_to(counts.items_seen))
            .bind(count_to(counts.items_new))
            .bind(count_to(counts.items_removed)),
            RunFinish::Failed { code, message } => sqlx::query(
                r#"
                UPDATE scrape_runs
                   SET status = 'failed', finished_at = $2, error_code = $3, error_message = $4
                 WHERE id = $1 AND status NOT IN ('success', 'failed')
                "#,
            )
            .bind(run_id)
            .bind(finished_at)
            .bind(code.as_str())
            .bind(message.as_str()),
        };
        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("finalizing run {run_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_seen_items(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        items: &[DiscoveredItem],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let items = dedupe_discovered(items.to_vec());
        if items.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let (ids, urls): (Vec<String>, Vec<String>) = items
            .into_iter()
            .map(|item| (item.source_item_id, item.url))
            .unzip();

        // `prev` reads the pre-statement snapshot, so it still sees removed rows.
        let row = sqlx::query(
            r#"
            WITH input AS (
                SELECT source_item_id, url
                  FROM UNNEST($4::text[], $5::text[]) AS t(source_item_id, url)
            ),
            prev AS (
                SELECT i.source_item_id, i.is_active
                  FROM items i
                  JOIN input USING (source_item_id)
                 WHERE i.customer_id = $1 AND i.data_source_id = $2
            ),
            upserted AS (
                INSERT INTO items
                    (customer_id, data_source_id, source_item_id, url, is_active, removed_at,
                     last_seen_at, last_seen_run_id, created_at)
                SELECT $1, $2, source_item_id, url, TRUE, NULL, $6, $3, $6
                  FROM input
                ON CONFLICT (customer_id, data_source_id, source_item_id) DO UPDATE
                   SET url = EXCLUDED.url,
                       is_active = TRUE,
                       removed_at = NULL,
                       last_seen_at = EXCLUDED.last_seen_at,
                       last_seen_run_id = EXCLUDED.last_seen_run_id
                RETURNING source_item_id, (xmax = 0) AS inserted
            )
            SELECT COUNT(*) FILTER (WHERE u.inserted) AS inserted,
                   COUNT(*) FILTER (WHERE NOT u.inserted) AS updated,
                   COUNT(*) FILTER (WHERE NOT u.inserted AND p.is_active = FALSE) AS reactivated
              FROM upserted u
              LEFT JOIN prev p USING (source_item_id)
            "#,
        )
        .bind(customer_id)
        .bind(data_source_id)
        .bind(run_id)
        .bind(&ids)
        .bind(&urls)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting seen items for run {run_id}"))?;

        Ok(UpsertSummary {
            inserted: count_from(row.try_get("inserted")?),
            updated: count_from(row.try_get("updated")?),
            reactivated: count_from(row.try_get("reactivated")?),
        })
    }

    async fn mark_unseen_removed(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        removed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE items
               SET is_active = FALSE, removed_at = $4
             WHERE customer_id = $1
               AND data_source_id = $2
               AND is_active
               AND last_seen_run_id IS DISTINCT FROM $3
            "#,
        )
        .bind(customer_id)
        .bind(data_source_id)
        .bind(run_id)
        .bind(removed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking unseen items removed for run {run_id}"))?;
        Ok(result.rows_affected() as usize)
    }

    async fn count_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
    ) -> Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending
              FROM items
             WHERE customer_id = $1
               AND data_source_id = $2
               AND last_seen_run_id = $3
               AND detail_fetched_at IS NULL
            "#,
        )
        .bind(customer_id)
        .bind(data_source_id)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("counting pending details for run {run_id}"))?;
        Ok(count_from(row.try_get("pending")?))
    }

    async fn list_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingDetail>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_item_id, url
              FROM items
             WHERE customer_id = $1
               AND data_source_id = $2
               AND last_seen_run_id = $3
               AND detail_fetched_at IS NULL
             ORDER BY created_at, id
             LIMIT $4
            "#,
        )
        .bind(customer_id)
        .bind(data_source_id)
        .bind(run_id)
        .bind(count_to(limit))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing pending details for run {run_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PendingDetail {
                item_id: row.try_get("id")?,
                source_item_id: row.try_get("source_item_id")?,
                url: row.try_get("url")?,
            });
        }
        Ok(out)
    }

    async fn save_item_detail(
        &self,
        item_id: Uuid,
        run_id: Uuid,
        update: &DetailUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let base = &update.fields.base_fields;
        sqlx::query(
            r#"
            UPDATE items
               SET title = $3,
                   description_text = $4,
                   price_amount = $5,
                   price_currency = $6,
                   primary_image_url = $7,
                   image_urls_json = $8,
                   attributes_json = $9,
                   content_hash = $10,
                   detail_fetched_at = $11,
                   last_detail_run_id = $2
             WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(run_id)
        .bind(&base.title)
        .bind(&base.description_text)
        .bind(base.price_amount)
        .bind(&base.price_currency)
        .bind(&base.primary_image_url)
        .bind(serde_json::json!(update.fields.image_urls))
        .bind(JsonValue::Object(update.fields.attributes_json.clone()))
        .bind(&update.content_hash)
        .bind(fetched_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving detail for item {item_id}"))?;
        Ok(())
    }

    async fn list_items(&self, customer_id: Uuid, data_source_id: Uuid) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, data_source_id, source_item_id, url, title, description_text,
                   price_amount, price_currency, primary_image_url, image_urls_json,
                   attributes_json, content_hash, is_active, removed_at, last_seen_at,
                   last_seen_run_id, detail_fetched_at, last_detail_run_id, created_at
              FROM items
             WHERE customer_id = $1 AND data_source_id = $2
             ORDER BY created_at, id
            "#,
        )
        .bind(customer_id)
        .bind(data_source_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing items for data source {data_source_id}"))?;
        rows.iter().map(item_from_row).collect()
    }
}
