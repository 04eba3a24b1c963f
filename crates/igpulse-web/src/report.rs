//! Plain-text weekly report in Japanese, assembled from stored metrics.
//! The output is meant to be pasted into a chat or notes app as-is.

use std::fmt::Write as _;

use chrono::Utc;

use igpulse_core::{agg, hashtags, DailyOverviewRow, PostWithMetrics};
use igpulse_storage::{StorageError, Store};

const REPORT_POST_LIMIT: i64 = 100;
const REPORT_DAYS: i64 = 30;
const TOP_POSTS: usize = 10;
const TOP_ENGAGEMENT: usize = 5;
const TOP_HASHTAGS: usize = 10;
const TOP_HASHTAG_SETS: usize = 5;
const DAILY_LINES: usize = 7;

pub async fn build_weekly_report(store: &Store) -> Result<String, StorageError> {
    let Some(account) = store.latest_account().await? else {
        return Ok(
            "アカウントが未接続です。先にInstagramアカウントを接続してください。".to_string(),
        );
    };
    let daily = store.daily_metrics(account.id, REPORT_DAYS).await?;
    let posts = store
        .posts_with_latest_insights(account.id, None, REPORT_POST_LIMIT)
        .await?;
    Ok(render_report(account.username.as_deref(), &daily, &posts))
}

/// Pure renderer; everything date-dependent is computed against today.
pub fn render_report(
    username: Option<&str>,
    daily: &[DailyOverviewRow],
    posts: &[PostWithMetrics],
) -> String {
    let today = Utc::now().date_naive();
    let mut out = String::new();

    let _ = writeln!(out, "📊 週次レポート {today}");
    let _ = writeln!(out, "アカウント: @{}", username.unwrap_or("(不明)"));
    let _ = writeln!(out);

    // Account summary
    let followers = daily.iter().rev().find_map(|row| row.followers_count);
    let weekly_delta = agg::weekly_follower_delta(daily);
    let wow = agg::week_over_week_save_rate(posts, today);
    let this_week_posts = agg::posts_this_week(posts, today);
    let phase = agg::phase_progress(followers.unwrap_or(0));

    let _ = writeln!(out, "■ サマリー");
    let _ = writeln!(out, "フォロワー: {}", fmt_count(followers));
    let _ = writeln!(out, "週間フォロワー増減: {weekly_delta:+}");
    let _ = writeln!(out, "今週の投稿数: {this_week_posts}");
    let _ = writeln!(
        out,
        "保存率 (今週/先週): {} / {}",
        fmt_pct(wow.this_week),
        fmt_pct(wow.last_week)
    );
    let _ = writeln!(
        out,
        "フェーズ{}: {} / {} (あと{})",
        phase.phase, phase.current, phase.target, phase.remaining
    );
    let _ = writeln!(out);

    // Daily tail
    let _ = writeln!(out, "■ 直近{DAILY_LINES}日");
    let tail_start = daily.len().saturating_sub(DAILY_LINES);
    if daily.is_empty() {
        let _ = writeln!(out, "(日次データがまだありません)");
    }
    for row in &daily[tail_start..] {
        let _ = writeln!(
            out,
            "{} | フォロワー {} ({}) | リーチ {} | プロフ閲覧 {}",
            row.metric_date,
            fmt_count(row.followers_count),
            row.follower_net_delta
                .map(|d| format!("{d:+}"))
                .unwrap_or_else(|| "±?".to_string()),
            fmt_count(row.reach),
            fmt_count(row.profile_views),
        );
    }
    let _ = writeln!(out);

    // Per-post detail block, save rate descending
    let mut ranked = posts.to_vec();
    agg::sort_by_save_rate_desc(&mut ranked);
    ranked.truncate(TOP_POSTS);

    let _ = writeln!(out, "■ 投稿別詳細（保存率順TOP{TOP_POSTS}）");
    if ranked.is_empty() {
        let _ = writeln!(out, "(投稿データがまだありません)");
    }
    for (rank, post) in ranked.iter().enumerate() {
        let engagement_total = post.like_count.unwrap_or(0)
            + post.comments_count.unwrap_or(0)
            + post.save_count.unwrap_or(0)
            + post.shares.unwrap_or(0);
        let _ = writeln!(out, "{}. {}", rank + 1, post.title);
        let _ = writeln!(out, "- post_id: {}", post.id);
        let _ = writeln!(
            out,
            "- permalink: {}",
            post.permalink.as_deref().unwrap_or("未取得")
        );
        let _ = writeln!(
            out,
            "- post_type: {}",
            post.media_type.as_deref().unwrap_or("未取得")
        );
        let _ = writeln!(
            out,
            "- posted_at: {}",
            post.posted_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "未取得".to_string())
        );
        let _ = writeln!(out, "- caption: {}", caption_head(post.caption.as_deref()));
        let _ = writeln!(
            out,
            "- slide_count: {}",
            post.slide_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "未取得".to_string())
        );
        let _ = writeln!(
            out,
            "- series: {}",
            post.series.map(|s| s.label()).unwrap_or("未設定")
        );
        let _ = writeln!(
            out,
            "- post_role: {}",
            post.content_role.map(|r| r.label()).unwrap_or("未設定")
        );
        let _ = writeln!(
            out,
            "- hashtag_set: {}",
            post.hashtag_set.as_deref().unwrap_or("captionから抽出")
        );
        let _ = writeln!(out, "- reach: {}", fmt_count(post.reach));
        let _ = writeln!(out, "- impressions: {}", fmt_count(post.impressions));
        let _ = writeln!(out, "- likes: {}", fmt_count(post.like_count));
        let _ = writeln!(out, "- comments: {}", fmt_count(post.comments_count));
        let _ = writeln!(out, "- saves: {}", fmt_count(post.save_count));
        let _ = writeln!(out, "- shares: {}", fmt_count(post.shares));
        let _ = writeln!(out, "- engagement_total: {engagement_total}");
        let _ = writeln!(out, "- save_rate: {}", fmt_opt_pct(post.save_rate));
        let _ = writeln!(
            out,
            "- engagement_rate: {}",
            fmt_opt_pct(agg::engagement_rate(post))
        );
        let _ = writeln!(out, "- video_views: {}", fmt_count(post.plays));
        let _ = writeln!(out, "- save_rate_rank: {}", rank + 1);
        let _ = writeln!(
            out,
            "- days_since_posted: {}",
            post.posted_at
                .map(|t| (today - t.date_naive()).num_days().max(0).to_string())
                .unwrap_or_else(|| "未取得".to_string())
        );
    }
    let _ = writeln!(out);

    // Engagement-rate ranking; posts without a known rate sort below
    // every numeric value.
    let mut by_engagement: Vec<(&PostWithMetrics, Option<f64>)> = posts
        .iter()
        .map(|post| (post, agg::engagement_rate(post)))
        .collect();
    by_engagement.sort_by(|a, b| {
        let ka = a.1.unwrap_or(-1.0);
        let kb = b.1.unwrap_or(-1.0);
        kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
    });
    by_engagement.truncate(TOP_ENGAGEMENT);

    let _ = writeln!(out, "■ エンゲージメント率TOP{TOP_ENGAGEMENT}");
    if by_engagement.is_empty() {
        let _ = writeln!(out, "(投稿データがまだありません)");
    }
    for (rank, (post, engagement)) in by_engagement.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} | エンゲージメント率 {} | 保存率 {}",
            rank + 1,
            post.title,
            fmt_opt_pct(*engagement),
            fmt_opt_pct(post.save_rate),
        );
    }
    let _ = writeln!(out);

    // Series
    let series = agg::build_series_aggregates(posts);
    let _ = writeln!(out, "■ シリーズ別");
    if series.is_empty() {
        let _ = writeln!(out, "(分類済みの投稿がまだありません)");
    }
    for row in &series {
        let _ = writeln!(
            out,
            "{}: {}件 | 平均保存率 {} | 型{} / 信頼{}",
            row.label,
            row.posts,
            fmt_pct(row.avg_save_rate),
            row.template_count,
            row.trust_count,
        );
    }
    let ratio = agg::content_role_ratio(posts);
    let _ = writeln!(
        out,
        "役割比率: 型 {} ({}) / 信頼 {} ({})",
        ratio.template,
        fmt_pct(ratio.template_rate),
        ratio.trust,
        fmt_pct(ratio.trust_rate),
    );
    let _ = writeln!(out);

    // Hashtags
    let tags = hashtags::build_hashtag_aggregates(posts);
    let _ = writeln!(out, "■ ハッシュタグTOP{TOP_HASHTAGS}");
    if tags.is_empty() {
        let _ = writeln!(out, "(ハッシュタグ付きの投稿がまだありません)");
    }
    for tag in tags.iter().take(TOP_HASHTAGS) {
        let _ = writeln!(
            out,
            "{}: {}件 | 平均保存率 {} | 平均リーチ {:.0} | 累計保存 {}",
            tag.tag,
            tag.posts,
            fmt_pct(tag.avg_save_rate),
            tag.avg_reach,
            tag.total_saves,
        );
    }
    let sets = hashtags::build_hashtag_set_performance(posts);
    if !sets.is_empty() {
        let _ = writeln!(out, "■ タグセットTOP{TOP_HASHTAG_SETS}");
        for set in sets.iter().take(TOP_HASHTAG_SETS) {
            let _ = writeln!(
                out,
                "{}: {}件 | 平均保存率 {} | 平均リーチ {:.0}",
                set.key,
                set.posts,
                fmt_pct(set.avg_save_rate),
                set.avg_reach,
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "※ リーチ・保存数は取得時点の値です。未取得の指標は集計から除外しています。");
    out
}

/// First 140 characters of the caption, raw; empty captions read 未取得.
fn caption_head(caption: Option<&str>) -> String {
    let head: String = caption.unwrap_or_default().chars().take(140).collect();
    if head.is_empty() {
        "未取得".to_string()
    } else {
        head
    }
}

fn fmt_count(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "未取得".to_string())
}

fn fmt_pct(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

fn fmt_opt_pct(rate: Option<f64>) -> String {
    rate.map(fmt_pct).unwrap_or_else(|| "未取得".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, Utc};
    use igpulse_core::{ContentRole, Series};
    use uuid::Uuid;

    fn posted(days_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(days_ago)
    }

    fn post(title: &str, save_count: i64, reach: i64) -> PostWithMetrics {
        let save_rate = save_count as f64 / reach as f64;
        PostWithMetrics {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            ig_media_id: format!("media-{title}"),
            caption: Some(format!("{title}\n#朝活 #手帳")),
            title: title.to_string(),
            media_type: Some("CAROUSEL_ALBUM".into()),
            media_product_type: None,
            permalink: Some(format!("https://example.com/{title}")),
            thumbnail_url: None,
            media_url: None,
            posted_at: Some(posted(2)),
            series: Some(Series::Journaling),
            slide_count: Some(8),
            content_role: Some(ContentRole::Template),
            ai_confidence: Some(0.9),
            ai_reason: Some("test".into()),
            hashtag_set: None,
            reach: Some(reach),
            save_count: Some(save_count),
            shares: Some(1),
            like_count: Some(40),
            comments_count: Some(3),
            plays: None,
            impressions: None,
            save_rate: Some(save_rate),
            share_rate: Some(1.0 / reach as f64),
            metric_date: Some(Utc::now().date_naive()),
        }
    }

    fn daily_row(date: &str, followers: i64, delta: Option<i64>) -> DailyOverviewRow {
        DailyOverviewRow {
            metric_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            followers_count: Some(followers),
            follows: Some(3),
            reach: Some(900),
            profile_views: Some(40),
            impressions: None,
            follower_net_delta: delta,
        }
    }

    #[test]
    fn empty_inputs_render_placeholders() {
        let text = render_report(None, &[], &[]);
        assert!(text.contains("週次レポート"));
        assert!(text.contains("日次データがまだありません"));
        assert!(text.contains("投稿データがまだありません"));
        assert!(text.contains("フォロワー: 未取得"));
    }

    #[test]
    fn top_posts_are_ranked_by_save_rate() {
        let posts = vec![post("low", 5, 1000), post("high", 80, 1000)];
        let daily = vec![
            daily_row("2026-08-18", 1200, None),
            daily_row("2026-08-19", 1210, Some(10)),
        ];
        let text = render_report(Some("tsuki"), &daily, &posts);
        let high = text.find("1. high").unwrap();
        let low = text.find("2. low").unwrap();
        assert!(high < low);
        assert!(text.contains("@tsuki"));
        assert!(text.contains("8.00%"));
    }

    #[test]
    fn post_detail_block_carries_engagement_fields() {
        let posts = vec![post("high", 80, 1000)];
        let text = render_report(Some("tsuki"), &[], &posts);
        // likes 40 + comments 3 + saves 80 + shares 1
        assert!(text.contains("- engagement_total: 124"));
        assert!(text.contains("- engagement_rate: 12.40%"));
        assert!(text.contains("- days_since_posted: 2"));
        assert!(text.contains("- post_id: "));
        assert!(text.contains("- hashtag_set: captionから抽出"));
        assert!(text.contains("- save_rate_rank: 1"));
    }

    #[test]
    fn engagement_ranking_section_is_sorted_with_unknown_rates_last() {
        let mut no_reach = post("unmeasured", 0, 1);
        no_reach.reach = None;
        no_reach.save_rate = None;
        let posts = vec![no_reach, post("low", 5, 1000), post("high", 80, 1000)];
        let text = render_report(Some("tsuki"), &[], &posts);
        let section = text.find("エンゲージメント率TOP5").unwrap();
        let high = text[section..].find("high").map(|i| i + section).unwrap();
        let low = text[section..].find("low").map(|i| i + section).unwrap();
        let unmeasured = text[section..]
            .find("unmeasured")
            .map(|i| i + section)
            .unwrap();
        assert!(high < low);
        assert!(low < unmeasured);
    }

    #[test]
    fn hashtag_section_lists_extracted_tags() {
        let posts = vec![post("tagged", 10, 500)];
        let text = render_report(Some("tsuki"), &[], &posts);
        assert!(text.contains("#朝活"));
        assert!(text.contains("#手帳"));
    }

    #[test]
    fn series_section_uses_japanese_labels() {
        let posts = vec![post("a", 10, 500), post("b", 20, 500)];
        let text = render_report(Some("tsuki"), &[], &posts);
        assert!(text.contains(Series::Journaling.label()));
        assert!(text.contains("役割比率"));
    }

    #[test]
    fn header_carries_todays_date() {
        let text = render_report(None, &[], &[]);
        assert!(text.contains(&Utc::now().date_naive().to_string()));
    }
}
