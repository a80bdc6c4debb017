use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, QueryBuilder, Row,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::database_ops::attribute::AttributeKind;
use crate::database_ops::store::{AssociationDelta, CatalogStore, GameUpsert, PricePoint};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = crate::util::env::env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to postgres")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Row counts of the catalog tables, in a stable order.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut tables = vec!["games", "price_history"];
        for kind in AttributeKind::ALL {
            tables.push(kind.table());
            tables.push(kind.link_table());
        }
        let mut out = Vec::with_capacity(tables.len());
        for table in tables {
            let n = match sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
                .persistent(false)
                .fetch_one(&self.pool)
                .await
            {
                Ok(n) => n,
                // Schema not applied yet.
                Err(e) if is_undefined_table_error(&e) => 0,
                Err(e) => return Err(anyhow::Error::new(e).context(format!("count {table}"))),
            };
            out.push((table, n));
        }
        Ok(out)
    }
}

fn is_undefined_table_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

#[async_trait::async_trait]
impl CatalogStore for Db {
    #[instrument(skip(self))]
    async fn load_attributes(&self, kind: AttributeKind) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT {id}, {name} FROM {table}",
            id = kind.id_column(),
            name = kind.name_column(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            let id: i64 = r.try_get(0)?;
            let name: String = r.try_get(1)?;
            out.insert(name, id);
        }
        debug!(%kind, entries = out.len(), "loaded attribute dictionary");
        Ok(out)
    }

    #[instrument(skip(self, names), fields(count = names.len()))]
    async fn insert_attributes(&self, kind: AttributeKind, names: &[String]) -> Result<u64> {
        if names.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", kind.table(), kind.name_column()));
        qb.push_values(names, |mut b, name| {
            b.push_bind(name);
        });
        qb.push(format!(" ON CONFLICT ({}) DO NOTHING", kind.name_column()));
        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip(self))]
    async fn load_associations(
        &self,
        kind: AttributeKind,
    ) -> Result<HashMap<i64, BTreeSet<i64>>> {
        let sql = format!(
            "SELECT game_id, array_agg({id}) FROM {link} GROUP BY game_id",
            id = kind.id_column(),
            link = kind.link_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            let game_id: i64 = r.try_get(0)?;
            let ids: Vec<i64> = r.try_get(1)?;
            out.insert(game_id, ids.into_iter().collect());
        }
        Ok(out)
    }

    #[instrument(skip(self, game), fields(steam_id = game.steam_id))]
    async fn upsert_game(&self, game: &GameUpsert) -> Result<i64> {
        let game_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO games (steam_id, title, link, available, release_date,
                               supports_win, supports_linux, supports_mac,
                               positive_reviews, total_reviews)
            VALUES ($1, $2, $3, TRUE, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (steam_id) DO UPDATE
            SET title = EXCLUDED.title,
                link = EXCLUDED.link,
                available = TRUE,
                release_date = EXCLUDED.release_date,
                supports_win = EXCLUDED.supports_win,
                supports_linux = EXCLUDED.supports_linux,
                supports_mac = EXCLUDED.supports_mac,
                positive_reviews = EXCLUDED.positive_reviews,
                total_reviews = EXCLUDED.total_reviews
            RETURNING game_id
            "#,
        )
        .bind(game.steam_id)
        .bind(&game.title)
        .bind(&game.link)
        .bind(game.release_date)
        .bind(game.supports_win)
        .bind(game.supports_linux)
        .bind(game.supports_mac)
        .bind(game.positive_reviews)
        .bind(game.total_reviews)
        .fetch_one(&self.pool)
        .await?;
        Ok(game_id)
    }

    #[instrument(skip(self, delta), fields(add = delta.add.len(), remove = delta.remove.len()))]
    async fn apply_association_delta(
        &self,
        kind: AttributeKind,
        game_id: i64,
        delta: &AssociationDelta,
    ) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        if !delta.add.is_empty() {
            let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (game_id, {}) ",
                kind.link_table(),
                kind.id_column()
            ));
            qb.push_values(delta.add.iter(), |mut b, attr_id| {
                b.push_bind(game_id).push_bind(*attr_id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }
        if !delta.remove.is_empty() {
            let remove: Vec<i64> = delta.remove.iter().copied().collect();
            sqlx::query(&format!(
                "DELETE FROM {} WHERE game_id = $1 AND {} = ANY($2)",
                kind.link_table(),
                kind.id_column()
            ))
            .bind(game_id)
            .bind(&remove)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_price(&self, game_id: i64) -> Result<Option<PricePoint>> {
        let row = sqlx::query(
            r#"
            SELECT price_wo_discount::float8, price_w_discount::float8
            FROM price_history
            WHERE game_id = $1
            ORDER BY date_time DESC
            LIMIT 1
            "#,
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(PricePoint::new(r.try_get(0)?, r.try_get(1)?))),
            None => Ok(None),
        }
    }

    async fn append_price(
        &self,
        game_id: i64,
        price: PricePoint,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_history (game_id, price_wo_discount, price_w_discount, date_time)
            VALUES ($1, $2::numeric, $3::numeric, $4)
            "#,
        )
        .bind(game_id)
        .bind(price.price_wo_discount)
        .bind(price.price_w_discount)
        .bind(observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_known_steam_ids(&self) -> Result<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT steam_id FROM games")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, steam_ids), fields(count = steam_ids.len()))]
    async fn mark_unavailable(&self, steam_ids: &[i64]) -> Result<u64> {
        if steam_ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query("UPDATE games SET available = FALSE WHERE steam_id = ANY($1)")
            .bind(steam_ids)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
