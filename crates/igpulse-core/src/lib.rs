//! Core domain model and pure aggregation logic for Instagram Growth Pulse.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod agg;
pub mod hashtags;

pub const CRATE_NAME: &str = "igpulse-core";

/// Content series bucket assigned to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Series {
    Judgment,
    Distance,
    Emotion,
    Thinking,
    Procrastination,
    Journaling,
    Love,
    Tsuki,
}

impl Series {
    pub const ALL: [Series; 8] = [
        Series::Judgment,
        Series::Distance,
        Series::Emotion,
        Series::Thinking,
        Series::Procrastination,
        Series::Journaling,
        Series::Love,
        Series::Tsuki,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Series::Judgment => "judgment",
            Series::Distance => "distance",
            Series::Emotion => "emotion",
            Series::Thinking => "thinking",
            Series::Procrastination => "procrastination",
            Series::Journaling => "journaling",
            Series::Love => "love",
            Series::Tsuki => "tsuki",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Series::Judgment => "判断基準",
            Series::Distance => "距離感",
            Series::Emotion => "感情整理",
            Series::Thinking => "思考の癖",
            Series::Procrastination => "先延ばし",
            Series::Journaling => "ジャーナリング",
            Series::Love => "恋愛×思考整理",
            Series::Tsuki => "つきの思考開示",
        }
    }

    pub fn parse(value: &str) -> Option<Series> {
        Series::ALL.iter().copied().find(|s| s.as_str() == value)
    }
}

/// Whether a post hands over an actionable template or builds trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    Template,
    Trust,
}

impl ContentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentRole::Template => "template",
            ContentRole::Trust => "trust",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ContentRole::Template => "① 型を渡す",
            ContentRole::Trust => "② 信頼を積む",
        }
    }

    pub fn parse(value: &str) -> Option<ContentRole> {
        match value {
            "template" => Some(ContentRole::Template),
            "trust" => Some(ContentRole::Trust),
            _ => None,
        }
    }
}

/// Classifier output; persisted on a media item as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub series: Series,
    pub content_role: ContentRole,
    pub confidence: f64,
    pub reason: String,
}

/// Connected professional account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub ig_user_id: String,
    pub username: Option<String>,
    pub account_type: Option<String>,
    pub profile_picture_url: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile as fetched from the provider, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub ig_user_id: String,
    pub username: Option<String>,
    pub account_type: Option<String>,
    pub profile_picture_url: Option<String>,
    pub raw: JsonValue,
}

/// Access token response from the OAuth exchange or refresh call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub raw: JsonValue,
}

impl TokenResponse {
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| issued_at + chrono::Duration::seconds(secs))
    }
}

/// One recent post as fetched from the provider's media edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentMedia {
    pub ig_media_id: String,
    pub caption: Option<String>,
    pub media_type: Option<String>,
    pub media_product_type: Option<String>,
    pub permalink: Option<String>,
    pub thumbnail_url: Option<String>,
    pub media_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub like_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub raw: JsonValue,
}

/// Day-windowed account metric snapshot. Absent provider metrics stay None;
/// zero and "unknown" are distinct values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDailyInsights {
    pub metric_date: NaiveDate,
    pub followers_count: Option<i64>,
    pub follows: Option<i64>,
    pub reach: Option<i64>,
    pub profile_views: Option<i64>,
    pub impressions: Option<i64>,
    pub raw: JsonValue,
}

/// Per-post metric snapshot for one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDailyInsights {
    pub metric_date: NaiveDate,
    pub reach: Option<i64>,
    pub impressions: Option<i64>,
    pub plays: Option<i64>,
    pub save_count: Option<i64>,
    pub shares: Option<i64>,
    pub like_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub raw: JsonValue,
}

/// One row of the growth overview: daily account metrics with the
/// follower delta against the previous row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyOverviewRow {
    pub metric_date: NaiveDate,
    pub followers_count: Option<i64>,
    pub follows: Option<i64>,
    pub reach: Option<i64>,
    pub profile_views: Option<i64>,
    pub impressions: Option<i64>,
    pub follower_net_delta: Option<i64>,
}

/// A media item joined with its most recent daily insight row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostWithMetrics {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ig_media_id: String,
    pub caption: Option<String>,
    pub title: String,
    pub media_type: Option<String>,
    pub media_product_type: Option<String>,
    pub permalink: Option<String>,
    pub thumbnail_url: Option<String>,
    pub media_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub series: Option<Series>,
    pub slide_count: Option<i32>,
    pub content_role: Option<ContentRole>,
    pub ai_confidence: Option<f64>,
    pub ai_reason: Option<String>,
    pub hashtag_set: Option<String>,
    pub reach: Option<i64>,
    pub save_count: Option<i64>,
    pub shares: Option<i64>,
    pub like_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub plays: Option<i64>,
    pub impressions: Option<i64>,
    pub save_rate: Option<f64>,
    pub share_rate: Option<f64>,
    pub metric_date: Option<NaiveDate>,
}

/// First non-blank caption line, capped at 60 characters.
pub fn caption_to_title(caption: Option<&str>) -> String {
    let Some(caption) = caption else {
        return "（captionなし）".to_string();
    };
    let first_line = caption
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or(caption);
    first_line.chars().take(60).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_title_takes_first_non_blank_line() {
        let caption = "\n  \n迷ったときの判断基準7つ\n本文はここから";
        assert_eq!(caption_to_title(Some(caption)), "迷ったときの判断基準7つ");
    }

    #[test]
    fn caption_title_handles_missing_caption() {
        assert_eq!(caption_to_title(None), "（captionなし）");
    }

    #[test]
    fn caption_title_caps_at_sixty_chars() {
        let long = "あ".repeat(100);
        assert_eq!(caption_to_title(Some(&long)).chars().count(), 60);
    }

    #[test]
    fn series_round_trips_through_str() {
        for series in Series::ALL {
            assert_eq!(Series::parse(series.as_str()), Some(series));
        }
        assert_eq!(Series::parse("unknown"), None);
    }

    #[test]
    fn token_expiry_derives_from_issued_at() {
        let token = TokenResponse {
            access_token: "t".into(),
            token_type: Some("bearer".into()),
            expires_in: Some(3600),
            scope: None,
            raw: JsonValue::Null,
        };
        let issued = Utc::now();
        assert_eq!(token.expires_at(issued), Some(issued + chrono::Duration::hours(1)));
        let no_expiry = TokenResponse { expires_in: None, ..token };
        assert_eq!(no_expiry.expires_at(issued), None);
    }
}
