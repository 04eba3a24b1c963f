//! Persistence gateway over Postgres. All writes are idempotent upserts
//! keyed by the natural keys (ig_user_id, account_id, account+date,
//! ig_media_id, media+date), so re-running a sync on the same day
//! overwrites instead of duplicating.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use igpulse_core::{
    agg, caption_to_title, Account, AccountDailyInsights, Classification, ContentRole,
    DailyOverviewRow, MediaDailyInsights, PostWithMetrics, Profile, RecentMedia, Series,
    TokenResponse,
};

pub const CRATE_NAME: &str = "igpulse-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// A token joined with its account, ready for a sync run.
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub account_id: Uuid,
    pub ig_user_id: String,
    pub username: Option<String>,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Partial update for a media item. `None` leaves a column untouched;
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct MediaPatch {
    pub series: Option<Option<String>>,
    pub content_role: Option<Option<String>>,
    pub slide_count: Option<Option<i32>>,
    pub hashtag_set: Option<Option<String>>,
    pub ai_confidence: Option<Option<f64>>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use; lets the app start without a
    /// reachable database.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_account(&self, profile: &Profile) -> Result<Uuid, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ig_accounts (ig_user_id, username, account_type, profile_picture_url, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (ig_user_id) DO UPDATE
               SET username = EXCLUDED.username,
                   account_type = EXCLUDED.account_type,
                   profile_picture_url = EXCLUDED.profile_picture_url,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&profile.ig_user_id)
        .bind(&profile.username)
        .bind(&profile.account_type)
        .bind(&profile.profile_picture_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn upsert_token(
        &self,
        account_id: Uuid,
        token: &TokenResponse,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO ig_tokens (account_id, access_token, token_type, expires_at, scope, raw_token_response, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (account_id) DO UPDATE
               SET access_token = EXCLUDED.access_token,
                   token_type = EXCLUDED.token_type,
                   expires_at = EXCLUDED.expires_at,
                   scope = EXCLUDED.scope,
                   raw_token_response = EXCLUDED.raw_token_response,
                   updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(&token.access_token)
        .bind(&token.token_type)
        .bind(expires_at)
        .bind(&token.scope)
        .bind(&token.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_account_daily(
        &self,
        account_id: Uuid,
        insights: &AccountDailyInsights,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO account_daily_metrics
                (account_id, metric_date, followers_count, follows, reach, profile_views, impressions, raw_payload, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (account_id, metric_date) DO UPDATE
               SET followers_count = EXCLUDED.followers_count,
                   follows = EXCLUDED.follows,
                   reach = EXCLUDED.reach,
                   profile_views = EXCLUDED.profile_views,
                   impressions = EXCLUDED.impressions,
                   raw_payload = EXCLUDED.raw_payload,
                   updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(insights.metric_date)
        .bind(insights.followers_count)
        .bind(insights.follows)
        .bind(insights.reach)
        .bind(insights.profile_views)
        .bind(insights.impressions)
        .bind(&insights.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Metric sync never touches classification columns.
    pub async fn upsert_media_item(
        &self,
        account_id: Uuid,
        media: &RecentMedia,
    ) -> Result<Uuid, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO media_items
                (account_id, ig_media_id, caption, media_type, media_product_type,
                 permalink, thumbnail_url, media_url, posted_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (ig_media_id) DO UPDATE
               SET caption = EXCLUDED.caption,
                   media_type = EXCLUDED.media_type,
                   media_product_type = EXCLUDED.media_product_type,
                   permalink = EXCLUDED.permalink,
                   thumbnail_url = EXCLUDED.thumbnail_url,
                   media_url = EXCLUDED.media_url,
                   posted_at = EXCLUDED.posted_at,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(account_id)
        .bind(&media.ig_media_id)
        .bind(&media.caption)
        .bind(&media.media_type)
        .bind(&media.media_product_type)
        .bind(&media.permalink)
        .bind(&media.thumbnail_url)
        .bind(&media.media_url)
        .bind(media.posted_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn upsert_media_daily(
        &self,
        media_item_id: Uuid,
        insights: &MediaDailyInsights,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO media_insights_daily
                (media_item_id, metric_date, like_count, comments_count, save_count,
                 shares, reach, plays, impressions, raw_payload, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (media_item_id, metric_date) DO UPDATE
               SET like_count = EXCLUDED.like_count,
                   comments_count = EXCLUDED.comments_count,
                   save_count = EXCLUDED.save_count,
                   shares = EXCLUDED.shares,
                   reach = EXCLUDED.reach,
                   plays = EXCLUDED.plays,
                   impressions = EXCLUDED.impressions,
                   raw_payload = EXCLUDED.raw_payload,
                   updated_at = NOW()
            "#,
        )
        .bind(media_item_id)
        .bind(insights.metric_date)
        .bind(insights.like_count)
        .bind(insights.comments_count)
        .bind(insights.save_count)
        .bind(insights.shares)
        .bind(insights.reach)
        .bind(insights.plays)
        .bind(insights.impressions)
        .bind(&insights.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn connected_accounts(&self) -> Result<Vec<ConnectedAccount>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT t.account_id, t.access_token, t.expires_at, a.ig_user_id, a.username
              FROM ig_tokens t
              JOIN ig_accounts a ON a.id = t.account_id
             ORDER BY t.updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConnectedAccount {
                account_id: row.try_get("account_id")?,
                ig_user_id: row.try_get("ig_user_id")?,
                username: row.try_get("username")?,
                access_token: row.try_get("access_token")?,
                expires_at: row.try_get("expires_at")?,
            });
        }
        Ok(out)
    }

    pub async fn latest_account(&self) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, ig_user_id, username, account_type, profile_picture_url, connected_at, updated_at
              FROM ig_accounts
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Account {
                id: row.try_get("id")?,
                ig_user_id: row.try_get("ig_user_id")?,
                username: row.try_get("username")?,
                account_type: row.try_get("account_type")?,
                profile_picture_url: row.try_get("profile_picture_url")?,
                connected_at: row.try_get("connected_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Daily rows with follower deltas for the trailing window, oldest first.
    pub async fn daily_metrics(
        &self,
        account_id: Uuid,
        days: i64,
    ) -> Result<Vec<DailyOverviewRow>, StorageError> {
        let since: NaiveDate = (Utc::now() - Duration::days(days)).date_naive();
        let rows = sqlx::query(
            r#"
            SELECT metric_date, followers_count, follows, reach, profile_views, impressions, follower_net_delta
              FROM growth_overview
             WHERE account_id = $1
               AND metric_date >= $2
             ORDER BY metric_date ASC
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DailyOverviewRow {
                metric_date: row.try_get("metric_date")?,
                followers_count: row.try_get("followers_count")?,
                follows: row.try_get("follows")?,
                reach: row.try_get("reach")?,
                profile_views: row.try_get("profile_views")?,
                impressions: row.try_get("impressions")?,
                follower_net_delta: row.try_get("follower_net_delta")?,
            });
        }
        Ok(out)
    }

    /// Media items joined with their most recent daily insight row.
    pub async fn posts_with_latest_insights(
        &self,
        account_id: Uuid,
        series: Option<&str>,
        limit: i64,
    ) -> Result<Vec<PostWithMetrics>, StorageError> {
        let media_rows = sqlx::query(
            r#"
            SELECT id, account_id, ig_media_id, caption, media_type, media_product_type,
                   permalink, thumbnail_url, media_url, posted_at, series, slide_count,
                   content_role, ai_confidence, ai_reason, hashtag_set
              FROM media_items
             WHERE account_id = $1
               AND ($2::text IS NULL OR series = $2)
             ORDER BY posted_at DESC NULLS LAST
             LIMIT $3
            "#,
        )
        .bind(account_id)
        .bind(series)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if media_rows.is_empty() {
            return Ok(Vec::new());
        }

        let media_ids: Vec<Uuid> = media_rows
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<_, _>>()?;

        // Latest row per media item: ordered by date descending, first one wins.
        let insight_rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (media_item_id)
                   media_item_id, metric_date, like_count, comments_count,
                   save_count, shares, reach, plays, impressions
              FROM media_insights_daily
             WHERE media_item_id = ANY($1)
             ORDER BY media_item_id, metric_date DESC
            "#,
        )
        .bind(&media_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut latest_by_media = std::collections::HashMap::new();
        for row in &insight_rows {
            let media_item_id: Uuid = row.try_get("media_item_id")?;
            latest_by_media.insert(media_item_id, row);
        }
        debug!(
            media = media_rows.len(),
            with_insights = latest_by_media.len(),
            "assembled posts with latest insights"
        );

        let mut posts = Vec::with_capacity(media_rows.len());
        for row in &media_rows {
            let id: Uuid = row.try_get("id")?;
            let caption: Option<String> = row.try_get("caption")?;
            let posted_at: Option<DateTime<Utc>> = row.try_get("posted_at")?;
            let insight = latest_by_media.get(&id);

            let reach: Option<i64> = insight.map(|r| r.try_get("reach")).transpose()?.flatten();
            let save_count: Option<i64> =
                insight.map(|r| r.try_get("save_count")).transpose()?.flatten();
            let shares: Option<i64> = insight.map(|r| r.try_get("shares")).transpose()?.flatten();
            let metric_date: Option<NaiveDate> =
                insight.map(|r| r.try_get("metric_date")).transpose()?;

            posts.push(PostWithMetrics {
                id,
                account_id: row.try_get("account_id")?,
                ig_media_id: row.try_get("ig_media_id")?,
                title: caption_to_title(caption.as_deref()),
                caption,
                media_type: row.try_get("media_type")?,
                media_product_type: row.try_get("media_product_type")?,
                permalink: row.try_get("permalink")?,
                thumbnail_url: row.try_get("thumbnail_url")?,
                media_url: row.try_get("media_url")?,
                posted_at,
                series: row
                    .try_get::<Option<String>, _>("series")?
                    .as_deref()
                    .and_then(Series::parse),
                slide_count: row.try_get("slide_count")?,
                content_role: row
                    .try_get::<Option<String>, _>("content_role")?
                    .as_deref()
                    .and_then(ContentRole::parse),
                ai_confidence: row.try_get("ai_confidence")?,
                ai_reason: row.try_get("ai_reason")?,
                hashtag_set: row.try_get("hashtag_set")?,
                reach,
                save_count,
                shares,
                like_count: insight.map(|r| r.try_get("like_count")).transpose()?.flatten(),
                comments_count: insight
                    .map(|r| r.try_get("comments_count"))
                    .transpose()?
                    .flatten(),
                plays: insight.map(|r| r.try_get("plays")).transpose()?.flatten(),
                impressions: insight.map(|r| r.try_get("impressions")).transpose()?.flatten(),
                save_rate: agg::rate(save_count, reach),
                share_rate: agg::rate(shares, reach),
                metric_date: metric_date.or_else(|| posted_at.map(|dt| dt.date_naive())),
            });
        }
        Ok(posts)
    }

    /// Posts whose classification fields are still unset, newest first.
    pub async fn unclassified_media(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(Uuid, Option<String>)>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, caption
              FROM media_items
             WHERE account_id = $1
               AND series IS NULL
             ORDER BY posted_at DESC NULLS LAST
             LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("caption")?)))
            .collect()
    }

    pub async fn media_caption(
        &self,
        media_id: Uuid,
    ) -> Result<Option<Option<String>>, StorageError> {
        let row = sqlx::query("SELECT caption FROM media_items WHERE id = $1")
            .bind(media_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(row.try_get("caption")?)).transpose()
    }

    /// All classification fields are written together.
    pub async fn set_classification(
        &self,
        media_id: Uuid,
        classification: &Classification,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE media_items
               SET series = $2,
                   content_role = $3,
                   ai_confidence = $4,
                   ai_reason = $5,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(media_id)
        .bind(classification.series.as_str())
        .bind(classification.content_role.as_str())
        .bind(classification.confidence)
        .bind(&classification.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies a partial patch; untouched columns keep their value.
    pub async fn update_media_fields(
        &self,
        media_id: Uuid,
        patch: &MediaPatch,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE media_items
               SET series = CASE WHEN $2 THEN $3 ELSE series END,
                   content_role = CASE WHEN $4 THEN $5 ELSE content_role END,
                   slide_count = CASE WHEN $6 THEN $7 ELSE slide_count END,
                   hashtag_set = CASE WHEN $8 THEN $9 ELSE hashtag_set END,
                   ai_confidence = CASE WHEN $10 THEN $11 ELSE ai_confidence END,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(media_id)
        .bind(patch.series.is_some())
        .bind(patch.series.clone().flatten())
        .bind(patch.content_role.is_some())
        .bind(patch.content_role.clone().flatten())
        .bind(patch.slide_count.is_some())
        .bind(patch.slide_count.flatten())
        .bind(patch.hashtag_set.is_some())
        .bind(patch.hashtag_set.clone().flatten())
        .bind(patch.ai_confidence.is_some())
        .bind(patch.ai_confidence.flatten())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
