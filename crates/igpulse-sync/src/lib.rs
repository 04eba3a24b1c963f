//! Per-account sync state machine and the sequential fan-out across all
//! connected accounts.
//!
//! One account runs to completion (or fails) before the next starts, which
//! caps concurrent provider load. A failing account is recorded and never
//! aborts its siblings.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use igpulse_meta::classify::Classifier;
use igpulse_meta::{MetaClient, MetaError};
use igpulse_storage::{ConnectedAccount, StorageError, Store};

pub const CRATE_NAME: &str = "igpulse-sync";

/// Recent posts fetched per sync run.
pub const MEDIA_BATCH: usize = 30;
/// Unclassified posts picked up per run.
pub const CLASSIFY_BATCH: i64 = 20;
/// Outstanding classifier calls at any moment.
pub const CLASSIFY_GROUP: usize = 5;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSyncSummary {
    pub account_id: Uuid,
    pub username: Option<String>,
    pub synced_at: DateTime<Utc>,
    pub metric_date: NaiveDate,
    pub media_count: usize,
    pub classified_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub account_id: Uuid,
    pub username: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub count: usize,
    pub date: NaiveDate,
    pub results: Vec<AccountSyncSummary>,
    pub failures: Vec<SyncFailure>,
}

/// Runs the full state machine for one account: token check, profile,
/// account metrics, media + per-post metrics, then classification.
pub async fn sync_one_account(
    store: &Store,
    meta: &MetaClient,
    classifier: &Classifier,
    connected: &ConnectedAccount,
) -> Result<AccountSyncSummary, SyncError> {
    let mut access_token = connected.access_token.clone();

    if let Some(refreshed) = meta
        .maybe_refresh_token(&access_token, connected.expires_at)
        .await?
    {
        let issued_at = Utc::now();
        let expires_at = refreshed.expires_at(issued_at);
        store
            .upsert_token(connected.account_id, &refreshed, expires_at)
            .await?;
        info!(account_id = %connected.account_id, "access token refreshed");
        access_token = refreshed.access_token;
    }

    let profile = meta.fetch_profile(&access_token).await?;
    let account_id = store.upsert_account(&profile).await?;

    let insights = meta
        .fetch_account_daily_insights(&access_token, &profile.ig_user_id)
        .await?;
    store.upsert_account_daily(account_id, &insights).await?;

    let media = meta
        .fetch_recent_media(&access_token, &profile.ig_user_id, MEDIA_BATCH)
        .await?;
    for item in &media {
        let media_item_id = store.upsert_media_item(account_id, item).await?;
        // Degrades to null metrics on a per-post provider failure.
        let daily = meta
            .fetch_media_daily_insights(
                &access_token,
                &item.ig_media_id,
                item.like_count,
                item.comments_count,
            )
            .await;
        store.upsert_media_daily(media_item_id, &daily).await?;
    }

    let classified_count = classify_pending(store, classifier, account_id).await?;

    info!(
        account_id = %account_id,
        media = media.len(),
        classified = classified_count,
        "account sync complete"
    );

    Ok(AccountSyncSummary {
        account_id,
        username: profile.username,
        synced_at: Utc::now(),
        metric_date: insights.metric_date,
        media_count: media.len(),
        classified_count,
    })
}

/// Classifies pending posts in concurrent groups; every group settles
/// before the next one starts, bounding outstanding external calls.
async fn classify_pending(
    store: &Store,
    classifier: &Classifier,
    account_id: Uuid,
) -> Result<usize, SyncError> {
    let pending = store.unclassified_media(account_id, CLASSIFY_BATCH).await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut classified = 0usize;
    for group in pending.chunks(CLASSIFY_GROUP) {
        let results = join_all(group.iter().map(|(media_id, caption)| async move {
            let title = igpulse_core::caption_to_title(caption.as_deref());
            let classification = classifier.classify(Some(&title), caption.as_deref()).await;
            (*media_id, classification)
        }))
        .await;

        for (media_id, classification) in results {
            store.set_classification(media_id, &classification).await?;
            classified += 1;
        }
    }
    Ok(classified)
}

/// Sequential fan-out over every connected account. Failures are isolated
/// per account and collected into the report.
pub async fn sync_all_accounts(
    store: &Store,
    meta: &MetaClient,
    classifier: &Classifier,
) -> Result<SyncReport, SyncError> {
    let accounts = store.connected_accounts().await?;
    Ok(fan_out(&accounts, |connected| async move {
        sync_one_account(store, meta, classifier, &connected).await
    })
    .await)
}

/// Runs `run` for each account in order. One account's error is recorded
/// as a failure and the loop moves on to the next account.
async fn fan_out<F, Fut>(accounts: &[ConnectedAccount], mut run: F) -> SyncReport
where
    F: FnMut(ConnectedAccount) -> Fut,
    Fut: Future<Output = Result<AccountSyncSummary, SyncError>>,
{
    let mut results = Vec::new();
    let mut failures = Vec::new();

    for connected in accounts {
        match run(connected.clone()).await {
            Ok(summary) => results.push(summary),
            Err(err) => {
                warn!(
                    account_id = %connected.account_id,
                    error = %err,
                    "account sync failed; continuing with remaining accounts"
                );
                failures.push(SyncFailure {
                    account_id: connected.account_id,
                    username: connected.username.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    SyncReport {
        count: results.len(),
        date: Utc::now().date_naive(),
        results,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_groups_are_bounded() {
        let pending: Vec<(Uuid, Option<String>)> =
            (0..13).map(|_| (Uuid::new_v4(), None)).collect();
        let groups: Vec<_> = pending.chunks(CLASSIFY_GROUP).collect();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() <= CLASSIFY_GROUP));
        assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), 13);
    }

    fn connected(name: &str) -> ConnectedAccount {
        ConnectedAccount {
            account_id: Uuid::new_v4(),
            ig_user_id: format!("1780{name}"),
            username: Some(name.to_string()),
            access_token: "tok".into(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn failing_account_never_aborts_siblings() {
        let accounts = vec![connected("broken"), connected("healthy")];
        let report = fan_out(&accounts, |account| async move {
            if account.username.as_deref() == Some("broken") {
                Err(SyncError::Meta(MetaError::Api {
                    status: 500,
                    message: "server exploded".into(),
                }))
            } else {
                Ok(AccountSyncSummary {
                    account_id: account.account_id,
                    username: account.username.clone(),
                    synced_at: Utc::now(),
                    metric_date: Utc::now().date_naive(),
                    media_count: 3,
                    classified_count: 1,
                })
            }
        })
        .await;

        assert_eq!(report.count, 1);
        assert_eq!(report.results[0].username.as_deref(), Some("healthy"));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].username.as_deref(), Some("broken"));
        assert!(report.failures[0].error.contains("server exploded"));
    }

    #[test]
    fn report_serializes_failures_alongside_results() {
        let report = SyncReport {
            count: 0,
            date: Utc::now().date_naive(),
            results: vec![],
            failures: vec![SyncFailure {
                account_id: Uuid::new_v4(),
                username: Some("tsuki".into()),
                error: "meta api error (500): boom".into(),
            }],
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["count"], 0);
        assert_eq!(value["failures"][0]["username"], "tsuki");
    }
}
