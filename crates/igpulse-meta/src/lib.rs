//! Instagram/Meta Graph API client: OAuth exchange and refresh, profile,
//! account insights, recent media and per-media insights.
//!
//! Third-party payloads are decoded defensively: a missing or oddly shaped
//! metric resolves to `None`, never to zero.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use url::Url;

use igpulse_core::{AccountDailyInsights, MediaDailyInsights, Profile, RecentMedia, TokenResponse};

pub mod classify;

pub const CRATE_NAME: &str = "igpulse-meta";

/// Tokens are refreshed only when expiry is this close (or already past).
pub const REFRESH_THRESHOLD_HOURS: i64 = 24;

const OAUTH_SCOPES: &str = "instagram_business_basic,instagram_business_manage_insights";

#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub api_version: String,
    pub graph_base_url: String,
    pub authorize_url: String,
    pub token_url: String,
    pub refresh_url: String,
    pub http_timeout_secs: u64,
}

impl MetaConfig {
    pub fn from_env() -> Self {
        Self {
            app_id: std::env::var("META_APP_ID").ok(),
            app_secret: std::env::var("META_APP_SECRET").ok(),
            redirect_uri: std::env::var("META_REDIRECT_URI").ok(),
            api_version: std::env::var("META_API_VERSION").unwrap_or_else(|_| "v21.0".to_string()),
            graph_base_url: std::env::var("META_GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com".to_string()),
            authorize_url: std::env::var("INSTAGRAM_OAUTH_AUTHORIZE_URL")
                .unwrap_or_else(|_| "https://www.instagram.com/oauth/authorize".to_string()),
            token_url: std::env::var("INSTAGRAM_OAUTH_TOKEN_URL")
                .unwrap_or_else(|_| "https://api.instagram.com/oauth/access_token".to_string()),
            refresh_url: std::env::var("INSTAGRAM_REFRESH_URL")
                .unwrap_or_else(|_| "https://graph.instagram.com/refresh_access_token".to_string()),
            http_timeout_secs: std::env::var("META_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("missing configuration: {0}")]
    Config(&'static str),
    #[error("meta request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("meta api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("meta response is not JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone)]
pub struct MetaClient {
    http: Client,
    config: MetaConfig,
}

impl MetaClient {
    pub fn new(config: MetaConfig) -> Result<Self, MetaError> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, MetaError> {
        Self::new(MetaConfig::from_env())
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// Provider authorize URL carrying the caller's anti-forgery state.
    pub fn build_authorize_url(&self, state: &str) -> Result<String, MetaError> {
        let app_id = self
            .config
            .app_id
            .as_deref()
            .ok_or(MetaError::Config("META_APP_ID"))?;
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or(MetaError::Config("META_REDIRECT_URI"))?;

        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|_| MetaError::Config("INSTAGRAM_OAUTH_AUTHORIZE_URL"))?;
        url.query_pairs_mut()
            .append_pair("enable_fb_login", "0")
            .append_pair("force_authentication", "1")
            .append_pair("client_id", app_id)
            .append_pair("app_id", app_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", OAUTH_SCOPES)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Trades an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, MetaError> {
        let app_id = self
            .config
            .app_id
            .as_deref()
            .ok_or(MetaError::Config("META_APP_ID"))?;
        let app_secret = self
            .config
            .app_secret
            .as_deref()
            .ok_or(MetaError::Config("META_APP_SECRET"))?;
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or(MetaError::Config("META_REDIRECT_URI"))?;

        let form = [
            ("client_id", app_id),
            ("client_secret", app_secret),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ];
        let response = self.http.post(&self.config.token_url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let value = parse_json(&body)?;

        if !status.is_success() {
            let message = value
                .get("error_message")
                .and_then(JsonValue::as_str)
                .or_else(|| value.pointer("/error/message").and_then(JsonValue::as_str))
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("Token exchange failed: {}", status.as_u16()));
            return Err(MetaError::Api { status: status.as_u16(), message });
        }

        token_from_raw(value)
    }

    /// Refreshes the token when expiry is near or past; a comfortably valid
    /// token is left alone so every sync does not burn API quota.
    pub async fn maybe_refresh_token(
        &self,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<TokenResponse>, MetaError> {
        if !needs_refresh(expires_at, Utc::now()) {
            return Ok(None);
        }

        let mut url = Url::parse(&self.config.refresh_url)
            .map_err(|_| MetaError::Config("INSTAGRAM_REFRESH_URL"))?;
        url.query_pairs_mut()
            .append_pair("grant_type", "ig_refresh_token")
            .append_pair("access_token", access_token);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let value = parse_json(&body)?;

        if !status.is_success() {
            let message = value
                .pointer("/error/message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("Token refresh failed: {}", status.as_u16()));
            return Err(MetaError::Api { status: status.as_u16(), message });
        }

        token_from_raw(value).map(Some)
    }

    pub async fn fetch_profile(&self, access_token: &str) -> Result<Profile, MetaError> {
        let raw = self
            .graph_get(
                "/me",
                access_token,
                &[("fields", "id,user_id,username,account_type,profile_picture_url")],
            )
            .await?;

        let ig_user_id = string_or_number(raw.get("user_id"))
            .or_else(|| string_or_number(raw.get("id")))
            .ok_or_else(|| MetaError::Json("profile payload has no id".to_string()))?;

        Ok(Profile {
            ig_user_id,
            username: raw.get("username").and_then(JsonValue::as_str).map(ToString::to_string),
            account_type: raw
                .get("account_type")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .or_else(|| Some("BUSINESS_OR_CREATOR".to_string())),
            profile_picture_url: raw
                .get("profile_picture_url")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
            raw,
        })
    }

    /// Today's account insights plus the current follower count.
    pub async fn fetch_account_daily_insights(
        &self,
        access_token: &str,
        ig_user_id: &str,
    ) -> Result<AccountDailyInsights, MetaError> {
        let insights_path = format!("/{ig_user_id}/insights");
        let profile_path = format!("/{ig_user_id}");
        // The Instagram Login flow exposes a different metric set than the
        // classic Graph API examples.
        let (insights, profile) = tokio::join!(
            self.graph_get(
                &insights_path,
                access_token,
                &[
                    ("metric", "reach,profile_views,views,follows_and_unfollows"),
                    ("period", "day"),
                ],
            ),
            self.graph_get(&profile_path, access_token, &[("fields", "followers_count")]),
        );
        let insights = insights?;
        let profile = profile?;

        Ok(AccountDailyInsights {
            metric_date: Utc::now().date_naive(),
            followers_count: profile
                .get("followers_count")
                .and_then(JsonValue::as_i64)
                .or_else(|| profile.get("follower_count").and_then(JsonValue::as_i64)),
            follows: follows_from_breakdown(&insights),
            reach: metric_value(&insights, &["reach", "accounts_reached"]),
            profile_views: metric_value(&insights, &["profile_views"]),
            impressions: metric_value(&insights, &["views", "impressions"]),
            raw: json!({ "insights": insights, "profile": profile }),
        })
    }

    /// Most recent posts, provider order (newest first).
    pub async fn fetch_recent_media(
        &self,
        access_token: &str,
        ig_user_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentMedia>, MetaError> {
        let path = format!("/{ig_user_id}/media");
        let limit = limit.to_string();
        let raw = self
            .graph_get(
                &path,
                access_token,
                &[
                    (
                        "fields",
                        "id,caption,media_type,media_product_type,permalink,thumbnail_url,media_url,timestamp,like_count,comments_count",
                    ),
                    ("limit", limit.as_str()),
                ],
            )
            .await?;

        let items = raw.get("data").and_then(JsonValue::as_array).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let ig_media_id = string_or_number(item.get("id"))?;
                Some(RecentMedia {
                    ig_media_id,
                    caption: str_field(&item, "caption"),
                    media_type: str_field(&item, "media_type"),
                    media_product_type: str_field(&item, "media_product_type"),
                    permalink: str_field(&item, "permalink"),
                    thumbnail_url: str_field(&item, "thumbnail_url"),
                    media_url: str_field(&item, "media_url"),
                    posted_at: item
                        .get("timestamp")
                        .and_then(JsonValue::as_str)
                        .and_then(parse_timestamp),
                    like_count: item.get("like_count").and_then(JsonValue::as_i64),
                    comments_count: item.get("comments_count").and_then(JsonValue::as_i64),
                    raw: item,
                })
            })
            .collect())
    }

    /// Per-post insights. A provider failure for one post must not abort the
    /// batch: it degrades to all-None metrics with the error kept in `raw`.
    pub async fn fetch_media_daily_insights(
        &self,
        access_token: &str,
        media_id: &str,
        fallback_likes: Option<i64>,
        fallback_comments: Option<i64>,
    ) -> MediaDailyInsights {
        let path = format!("/{media_id}/insights");
        let raw = match self
            .graph_get(&path, access_token, &[("metric", "reach,impressions,plays,saves,shares")])
            .await
        {
            Ok(value) => value,
            Err(err) => {
                warn!(media_id, error = %err, "media insights degraded to null metrics");
                json!({ "error": err.to_string(), "data": [] })
            }
        };
        media_insights_from_raw(raw, fallback_likes, fallback_comments)
    }

    async fn graph_get(
        &self,
        path: &str,
        access_token: &str,
        params: &[(&str, &str)],
    ) -> Result<JsonValue, MetaError> {
        let base = format!(
            "{}/{}{}",
            self.config.graph_base_url, self.config.api_version, path
        );
        let mut url = Url::parse(&base).map_err(|_| MetaError::Config("META_GRAPH_BASE_URL"))?;
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }
        url.query_pairs_mut().append_pair("access_token", access_token);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let value = parse_json(&body)?;

        if !status.is_success() {
            let message = value
                .pointer("/error/message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("Meta GET failed: {}", status.as_u16()));
            return Err(MetaError::Api { status: status.as_u16(), message });
        }
        Ok(value)
    }
}

/// Refresh is due when expiry is within the threshold or already past.
/// Unknown expiry never triggers a refresh.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(expires_at) => expires_at - now <= Duration::hours(REFRESH_THRESHOLD_HOURS),
        None => false,
    }
}

/// Ranked metric-name resolution over an insights payload: the first name
/// present with a numeric value wins. Absent means None, not zero.
pub fn metric_value(raw: &JsonValue, names: &[&str]) -> Option<i64> {
    let data = raw.get("data").and_then(JsonValue::as_array)?;
    for name in names {
        let Some(item) = data
            .iter()
            .find(|item| item.get("name").and_then(JsonValue::as_str) == Some(*name))
        else {
            continue;
        };
        let value = item
            .pointer("/total_value/value")
            .or_else(|| item.pointer("/values/0/value"))
            .or_else(|| item.get("value"));
        let Some(value) = value else { continue };
        if let Some(number) = value.as_i64() {
            return Some(number);
        }
        if let Some(text) = value.as_str() {
            if let Ok(number) = text.trim().parse::<i64>() {
                return Some(number);
            }
        }
    }
    None
}

/// Builds a per-post snapshot from a (possibly degraded) insights payload.
pub fn media_insights_from_raw(
    raw: JsonValue,
    fallback_likes: Option<i64>,
    fallback_comments: Option<i64>,
) -> MediaDailyInsights {
    MediaDailyInsights {
        metric_date: Utc::now().date_naive(),
        reach: metric_value(&raw, &["reach", "accounts_reached"]),
        impressions: metric_value(&raw, &["impressions", "views"]),
        plays: metric_value(&raw, &["plays", "video_views"]),
        save_count: metric_value(&raw, &["saves", "saved"]),
        shares: metric_value(&raw, &["shares"]),
        like_count: fallback_likes,
        comments_count: fallback_comments,
        raw,
    }
}

fn follows_from_breakdown(insights: &JsonValue) -> Option<i64> {
    let item = insights
        .get("data")
        .and_then(JsonValue::as_array)?
        .iter()
        .find(|item| {
            item.get("name").and_then(JsonValue::as_str) == Some("follows_and_unfollows")
        })?;
    item.pointer("/total_value/breakdowns/0/results")
        .and_then(JsonValue::as_array)?
        .iter()
        .find(|row| {
            row.get("dimension_values")
                .and_then(JsonValue::as_array)
                .map(|values| values.iter().any(|v| v.as_str() == Some("FOLLOWS")))
                .unwrap_or(false)
        })
        .and_then(|row| row.get("value").and_then(JsonValue::as_i64))
}

fn token_from_raw(raw: JsonValue) -> Result<TokenResponse, MetaError> {
    let access_token = raw
        .get("access_token")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| MetaError::Json("token payload has no access_token".to_string()))?;
    let scope = raw
        .get("permissions")
        .and_then(JsonValue::as_array)
        .map(|perms| {
            perms
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .or_else(|| raw.get("scope").and_then(JsonValue::as_str).map(ToString::to_string));

    Ok(TokenResponse {
        access_token,
        token_type: raw.get("token_type").and_then(JsonValue::as_str).map(ToString::to_string),
        expires_in: raw.get("expires_in").and_then(JsonValue::as_i64),
        scope,
        raw,
    })
}

fn parse_json(body: &str) -> Result<JsonValue, MetaError> {
    serde_json::from_str(body)
        .map_err(|_| MetaError::Json(body.chars().take(400).collect()))
}

fn str_field(item: &JsonValue, key: &str) -> Option<String> {
    item.get(key).and_then(JsonValue::as_str).map(ToString::to_string)
}

fn string_or_number(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_app() -> MetaConfig {
        MetaConfig {
            app_id: None,
            app_secret: None,
            redirect_uri: None,
            api_version: "v21.0".into(),
            graph_base_url: "https://graph.facebook.com".into(),
            authorize_url: "https://www.instagram.com/oauth/authorize".into(),
            token_url: "https://api.instagram.com/oauth/access_token".into(),
            refresh_url: "https://graph.instagram.com/refresh_access_token".into(),
            http_timeout_secs: 5,
        }
    }

    #[test]
    fn authorize_url_requires_app_identifiers() {
        let client = MetaClient::new(config_without_app()).unwrap();
        assert!(matches!(
            client.build_authorize_url("abc"),
            Err(MetaError::Config("META_APP_ID"))
        ));

        let mut config = config_without_app();
        config.app_id = Some("123".into());
        config.redirect_uri = Some("https://example.com/cb".into());
        let client = MetaClient::new(config).unwrap();
        let url = client.build_authorize_url("xyz").unwrap();
        assert!(url.contains("client_id=123"));
        assert!(url.contains("state=xyz"));
        assert!(url.contains("instagram_business_basic"));
    }

    #[test]
    fn refresh_threshold_separates_imminent_from_distant_expiry() {
        let now = Utc::now();
        assert!(needs_refresh(Some(now + Duration::minutes(10)), now));
        assert!(needs_refresh(Some(now - Duration::hours(1)), now));
        assert!(!needs_refresh(Some(now + Duration::days(2)), now));
        assert!(!needs_refresh(None, now));
    }

    #[test]
    fn metric_resolution_takes_first_ranked_name() {
        let raw = json!({
            "data": [
                { "name": "accounts_reached", "total_value": { "value": 420 } },
                { "name": "profile_views", "values": [ { "value": "17" } ] },
            ]
        });
        assert_eq!(metric_value(&raw, &["reach", "accounts_reached"]), Some(420));
        assert_eq!(metric_value(&raw, &["profile_views"]), Some(17));
        // absent metric is unknown, not zero
        assert_eq!(metric_value(&raw, &["impressions", "views"]), None);
        assert_eq!(metric_value(&json!({}), &["reach"]), None);
    }

    #[test]
    fn metric_resolution_skips_non_numeric_values() {
        let raw = json!({
            "data": [
                { "name": "reach", "value": { "nested": true } },
                { "name": "accounts_reached", "value": 99 },
            ]
        });
        assert_eq!(metric_value(&raw, &["reach", "accounts_reached"]), Some(99));
    }

    #[test]
    fn degraded_insights_keep_fallback_counts() {
        let raw = json!({ "error": "insights unavailable", "data": [] });
        let insights = media_insights_from_raw(raw, Some(12), Some(3));
        assert_eq!(insights.reach, None);
        assert_eq!(insights.save_count, None);
        assert_eq!(insights.shares, None);
        assert_eq!(insights.like_count, Some(12));
        assert_eq!(insights.comments_count, Some(3));
        assert_eq!(insights.raw["error"], "insights unavailable");
    }

    #[test]
    fn follows_resolved_from_breakdown_rows() {
        let insights = json!({
            "data": [{
                "name": "follows_and_unfollows",
                "total_value": {
                    "breakdowns": [{
                        "results": [
                            { "dimension_values": ["UNFOLLOWS"], "value": 4 },
                            { "dimension_values": ["FOLLOWS"], "value": 31 },
                        ]
                    }]
                }
            }]
        });
        assert_eq!(follows_from_breakdown(&insights), Some(31));
        assert_eq!(follows_from_breakdown(&json!({ "data": [] })), None);
    }

    #[test]
    fn token_payload_maps_permissions_to_scope() {
        let token = token_from_raw(json!({
            "access_token": "tok",
            "token_type": "bearer",
            "expires_in": 5_184_000,
            "permissions": ["instagram_business_basic", "instagram_business_manage_insights"]
        }))
        .unwrap();
        assert_eq!(token.access_token, "tok");
        assert_eq!(
            token.scope.as_deref(),
            Some("instagram_business_basic,instagram_business_manage_insights")
        );
        assert!(token_from_raw(json!({ "token_type": "bearer" })).is_err());
    }

    #[test]
    fn provider_timestamps_parse_with_and_without_colon_offset() {
        assert!(parse_timestamp("2026-08-18T09:30:00+0000").is_some());
        assert!(parse_timestamp("2026-08-18T09:30:00+00:00").is_some());
        assert!(parse_timestamp("not a date").is_none());
    }
}
