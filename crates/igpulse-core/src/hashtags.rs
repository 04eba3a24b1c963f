//! Hashtag extraction and per-tag / per-tag-set performance aggregation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::agg::average;
use crate::PostWithMetrics;

// Letters, digits, underscore plus hiragana, katakana, kanji and the long
// vowel mark. Matches tags in mixed Japanese/ASCII captions.
static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#[\p{L}\p{N}_ぁ-んァ-ヶ一-龠ー]+").expect("valid hashtag pattern"));

/// Lowercased hashtags in first-occurrence order, deduplicated per caption.
pub fn extract_hashtags(text: Option<&str>) -> Vec<String> {
    let Some(text) = text else {
        return Vec::new();
    };
    let mut seen = Vec::new();
    for m in TAG_PATTERN.find_iter(text) {
        let tag = m.as_str().to_lowercase();
        if !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

#[derive(Debug, Clone, Serialize)]
pub struct HashtagAggregate {
    pub tag: String,
    pub posts: usize,
    pub avg_reach: f64,
    pub avg_save_rate: f64,
    pub avg_likes: f64,
    pub total_saves: i64,
    pub recent_post_title: Option<String>,
    pub recent_posted_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TagBucket {
    posts: usize,
    reaches: Vec<f64>,
    save_rates: Vec<f64>,
    likes: Vec<f64>,
    total_saves: i64,
    recent_post_title: Option<String>,
    recent_posted_at: Option<DateTime<Utc>>,
}

impl TagBucket {
    fn absorb(&mut self, post: &PostWithMetrics) {
        self.posts += 1;
        if let Some(reach) = post.reach {
            self.reaches.push(reach as f64);
        }
        if let Some(save_rate) = post.save_rate {
            self.save_rates.push(save_rate);
        }
        if let Some(likes) = post.like_count {
            self.likes.push(likes as f64);
        }
        self.total_saves += post.save_count.unwrap_or(0);
        if post.posted_at > self.recent_posted_at {
            self.recent_posted_at = post.posted_at;
            self.recent_post_title = Some(post.title.clone());
        }
    }
}

/// Per-tag aggregates across all posts, sorted by mean save rate descending.
pub fn build_hashtag_aggregates(posts: &[PostWithMetrics]) -> Vec<HashtagAggregate> {
    let mut buckets: BTreeMap<String, TagBucket> = BTreeMap::new();
    for post in posts {
        for tag in extract_hashtags(post.caption.as_deref()) {
            buckets.entry(tag).or_default().absorb(post);
        }
    }

    let mut aggregates: Vec<HashtagAggregate> = buckets
        .into_iter()
        .map(|(tag, bucket)| HashtagAggregate {
            tag,
            posts: bucket.posts,
            avg_reach: average(&bucket.reaches),
            avg_save_rate: average(&bucket.save_rates),
            avg_likes: average(&bucket.likes),
            total_saves: bucket.total_saves,
            recent_post_title: bucket.recent_post_title,
            recent_posted_at: bucket.recent_posted_at,
        })
        .collect();
    aggregates.sort_by(|a, b| {
        b.avg_save_rate
            .partial_cmp(&a.avg_save_rate)
            .unwrap_or(Ordering::Equal)
    });
    aggregates
}

#[derive(Debug, Clone, Serialize)]
pub struct HashtagSetPerformance {
    pub key: String,
    pub posts: usize,
    pub avg_reach: f64,
    pub avg_save_rate: f64,
    pub avg_likes: f64,
}

/// Posts grouped by their full ordered tag set (tagless posts skipped),
/// sorted by mean save rate descending and capped to the top 20 sets.
pub fn build_hashtag_set_performance(posts: &[PostWithMetrics]) -> Vec<HashtagSetPerformance> {
    let mut buckets: BTreeMap<String, TagBucket> = BTreeMap::new();
    for post in posts {
        let tags = extract_hashtags(post.caption.as_deref());
        if tags.is_empty() {
            continue;
        }
        buckets.entry(tags.join(" ")).or_default().absorb(post);
    }

    let mut rows: Vec<HashtagSetPerformance> = buckets
        .into_iter()
        .map(|(key, bucket)| HashtagSetPerformance {
            key,
            posts: bucket.posts,
            avg_reach: average(&bucket.reaches),
            avg_save_rate: average(&bucket.save_rates),
            avg_likes: average(&bucket.likes),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.avg_save_rate
            .partial_cmp(&a.avg_save_rate)
            .unwrap_or(Ordering::Equal)
    });
    rows.truncate(20);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agg::rate;
    use uuid::Uuid;

    fn post(caption: &str, reach: Option<i64>, saves: Option<i64>) -> PostWithMetrics {
        PostWithMetrics {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            ig_media_id: "m".into(),
            caption: Some(caption.to_string()),
            title: crate::caption_to_title(Some(caption)),
            media_type: None,
            media_product_type: None,
            permalink: None,
            thumbnail_url: None,
            media_url: None,
            posted_at: None,
            series: None,
            slide_count: None,
            content_role: None,
            ai_confidence: None,
            ai_reason: None,
            hashtag_set: None,
            reach,
            save_count: saves,
            shares: None,
            like_count: None,
            comments_count: None,
            plays: None,
            impressions: None,
            save_rate: rate(saves, reach),
            share_rate: None,
            metric_date: None,
        }
    }

    #[test]
    fn extraction_is_case_normalized_and_deduped() {
        assert_eq!(extract_hashtags(Some("#A #a #B")), vec!["#a", "#b"]);
    }

    #[test]
    fn extraction_handles_japanese_tags() {
        let tags = extract_hashtags(Some("今日の気づき #思考整理 #ジャーナリング #mindset"));
        assert_eq!(tags, vec!["#思考整理", "#ジャーナリング", "#mindset"]);
    }

    #[test]
    fn extraction_is_order_independent_for_dedupe() {
        let forward = extract_hashtags(Some("#one #two"));
        let reversed = extract_hashtags(Some("#two #one"));
        assert_eq!(forward.len(), reversed.len());
        assert!(forward.iter().all(|t| reversed.contains(t)));
        assert!(extract_hashtags(None).is_empty());
    }

    #[test]
    fn tag_aggregates_rank_by_mean_save_rate() {
        let posts = vec![
            post("よかった #win", Some(1000), Some(50)),  // 0.05
            post("ふつう #meh", Some(1000), Some(10)),    // 0.01
            post("だめ #meh", Some(0), Some(3)),          // null rate, still counted
        ];
        let aggregates = build_hashtag_aggregates(&posts);
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].tag, "#win");
        assert_eq!(aggregates[0].avg_save_rate, 0.05);
        let meh = &aggregates[1];
        assert_eq!(meh.posts, 2);
        assert_eq!(meh.avg_save_rate, 0.01);
        assert_eq!(meh.total_saves, 13);
    }

    #[test]
    fn set_performance_skips_tagless_posts() {
        let posts = vec![
            post("#a #b 本文", Some(1000), Some(20)),
            post("タグなし投稿", Some(1000), Some(50)),
        ];
        let rows = build_hashtag_set_performance(&posts);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "#a #b");
        assert_eq!(rows[0].avg_save_rate, 0.02);
    }
}
