//! Pure dashboard aggregations over already-fetched rows. No I/O.

use std::cmp::Ordering;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::{ContentRole, DailyOverviewRow, PostWithMetrics, Series};

/// count / reach, defined only when reach is strictly positive and the
/// count is present. Never divides by zero.
pub fn rate(count: Option<i64>, reach: Option<i64>) -> Option<f64> {
    match (count, reach) {
        (Some(count), Some(reach)) if reach > 0 => Some(count as f64 / reach as f64),
        _ => None,
    }
}

/// likes + comments + saves + shares over reach.
pub fn engagement_rate(post: &PostWithMetrics) -> Option<f64> {
    let total = post.like_count.unwrap_or(0)
        + post.comments_count.unwrap_or(0)
        + post.save_count.unwrap_or(0)
        + post.shares.unwrap_or(0);
    rate(Some(total), post.reach)
}

/// Sum of follower deltas over the last 7 daily rows (rows are ordered by
/// date ascending; missing deltas count as 0).
pub fn weekly_follower_delta(daily: &[DailyOverviewRow]) -> i64 {
    let start = daily.len().saturating_sub(7);
    daily[start..]
        .iter()
        .map(|row| row.follower_net_delta.unwrap_or(0))
        .sum()
}

/// Monday of the calendar week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeekOverWeekSaveRate {
    pub this_week: f64,
    pub last_week: f64,
}

/// Average save rate for posts published this calendar week vs last week.
/// Only posts with a known save rate qualify; an empty partition yields 0.
pub fn week_over_week_save_rate(posts: &[PostWithMetrics], today: NaiveDate) -> WeekOverWeekSaveRate {
    let this_start = week_start(today);
    let last_start = this_start - Duration::days(7);

    let mut this_week = Vec::new();
    let mut last_week = Vec::new();
    for post in posts {
        let (Some(posted), Some(save_rate)) = (post.posted_at, post.save_rate) else {
            continue;
        };
        let posted = posted.date_naive();
        if posted >= this_start && posted <= today {
            this_week.push(save_rate);
        } else if posted >= last_start && posted < this_start {
            last_week.push(save_rate);
        }
    }

    WeekOverWeekSaveRate {
        this_week: average(&this_week),
        last_week: average(&last_week),
    }
}

/// Posts published since Monday of the current week.
pub fn posts_this_week(posts: &[PostWithMetrics], today: NaiveDate) -> usize {
    let this_start = week_start(today);
    posts
        .iter()
        .filter_map(|post| post.posted_at)
        .filter(|posted| {
            let posted = posted.date_naive();
            posted >= this_start && posted <= today
        })
        .count()
}

/// Stable descending sort by save rate; posts without a rate rank below
/// every numeric value.
pub fn sort_by_save_rate_desc(posts: &mut [PostWithMetrics]) {
    posts.sort_by(|a, b| {
        let ka = a.save_rate.unwrap_or(-1.0);
        let kb = b.save_rate.unwrap_or(-1.0);
        kb.partial_cmp(&ka).unwrap_or(Ordering::Equal)
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesAggregate {
    pub series: Series,
    pub label: &'static str,
    pub avg_save_rate: f64,
    pub posts: usize,
    pub template_count: usize,
    pub trust_count: usize,
}

/// Per-series mean save rate (over posts with a known rate) plus post and
/// content-role counts, sorted by mean save rate descending.
pub fn build_series_aggregates(posts: &[PostWithMetrics]) -> Vec<SeriesAggregate> {
    let mut aggregates = Vec::new();
    for series in Series::ALL {
        let group: Vec<&PostWithMetrics> =
            posts.iter().filter(|p| p.series == Some(series)).collect();
        if group.is_empty() {
            continue;
        }
        let rates: Vec<f64> = group.iter().filter_map(|p| p.save_rate).collect();
        aggregates.push(SeriesAggregate {
            series,
            label: series.label(),
            avg_save_rate: average(&rates),
            posts: group.len(),
            template_count: group
                .iter()
                .filter(|p| p.content_role == Some(ContentRole::Template))
                .count(),
            trust_count: group
                .iter()
                .filter(|p| p.content_role == Some(ContentRole::Trust))
                .count(),
        });
    }
    aggregates.sort_by(|a, b| {
        b.avg_save_rate
            .partial_cmp(&a.avg_save_rate)
            .unwrap_or(Ordering::Equal)
    });
    aggregates
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContentRoleRatio {
    pub template: usize,
    pub trust: usize,
    pub template_rate: f64,
    pub trust_rate: f64,
}

pub fn content_role_ratio(posts: &[PostWithMetrics]) -> ContentRoleRatio {
    let template = posts
        .iter()
        .filter(|p| p.content_role == Some(ContentRole::Template))
        .count();
    let trust = posts
        .iter()
        .filter(|p| p.content_role == Some(ContentRole::Trust))
        .count();
    let total = template + trust;
    ContentRoleRatio {
        template,
        trust,
        template_rate: if total > 0 { template as f64 / total as f64 } else { 0.0 },
        trust_rate: if total > 0 { trust as f64 / total as f64 } else { 0.0 },
    }
}

const PHASE_TARGETS: [i64; 3] = [1_000, 5_000, 10_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseProgress {
    pub phase: u8,
    pub current: i64,
    pub target: i64,
    pub remaining: i64,
}

/// Staged follower goal: which growth phase the account is in, the target
/// for that phase, and how far remains.
pub fn phase_progress(followers: i64) -> PhaseProgress {
    for (index, target) in PHASE_TARGETS.iter().enumerate() {
        if followers < *target {
            return PhaseProgress {
                phase: index as u8 + 1,
                current: followers,
                target: *target,
                remaining: *target - followers,
            };
        }
    }
    PhaseProgress {
        phase: PHASE_TARGETS.len() as u8,
        current: followers,
        target: PHASE_TARGETS[PHASE_TARGETS.len() - 1],
        remaining: 0,
    }
}

pub(crate) fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
