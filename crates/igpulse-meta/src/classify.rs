//! Content classification: ordered keyword decision table with an optional
//! Anthropic-assisted path. External failures always fall back to the
//! keyword rules; classification never surfaces an error to the caller.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use igpulse_core::{Classification, ContentRole, Series};

const HEURISTIC_CONFIDENCE: f64 = 0.55;
const REASON_CHAR_CAP: usize = 50;
const CAPTION_PROMPT_CHARS: usize = 200;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const SERIES_DEFINITIONS: &str = "\
- judgment（判断基準）: 迷ったとき・決断・向いてる向いてない・選択の判断軸
- distance（距離感）: 人間関係の距離・断り方・境界線・LINE・職場・友人
- emotion（感情整理）: イライラ・比較・落ち込み・感情の名前付け・感情仕分け
- thinking（思考の癖）: 完璧主義・自己批判・思い込み・認知のパターン
- procrastination（先延ばし）: 先延ばし・行動できない・やる気・動けない
- journaling（ジャーナリング）: 書く・質問・ワーク・ノート・自分に問いかける
- love（恋愛×思考整理）: 恋愛・パートナー・好き・気持ちの整理（恋愛文脈）
- tsuki（つきの思考開示）: つき自身の気づき・なぜこの考え方に至ったか
";

const ROLE_DEFINITIONS: &str = "\
- template（型を渡す）: チェックリスト・言い換えテンプレ・判断基準など「使える型」が主役
- trust（信頼を積む）: つきの視点・思考背景が見える。型を渡しつつ人柄が伝わる投稿
";

// First match wins; the order is the tie-break. The " procrast" fragment
// keeps its leading space as shipped in the production rule set.
static SERIES_RULES: Lazy<Vec<(Regex, Series)>> = Lazy::new(|| {
    [
        (r"(恋|好き|彼|彼女|パートナー|恋愛)", Series::Love),
        (r"(先延ばし|動けない|やる気| procrast)", Series::Procrastination),
        (r"(ジャーナル|ノート|書く|問い)", Series::Journaling),
        (r"(判断|決断|基準|選択)", Series::Judgment),
        (r"(距離|境界|断り|人間関係|line|職場)", Series::Distance),
        (r"(感情|イライラ|落ち込み|比較)", Series::Emotion),
        (r"(思考|完璧主義|自己批判|思い込み|認知)", Series::Thinking),
    ]
    .into_iter()
    .map(|(pattern, series)| (Regex::new(pattern).expect("valid series rule"), series))
    .collect()
});

static TEMPLATE_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(チェック|テンプレ|ステップ|方法|基準)").expect("valid role rule"));

#[derive(Debug, Clone)]
pub struct Classifier {
    api_key: Option<String>,
    http: Client,
}

impl Classifier {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            http: Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("ANTHROPIC_API_KEY").ok())
    }

    /// Assigns a series and content role to a post. Infallible: with no
    /// credential configured (or any external failure) the keyword table
    /// decides.
    pub async fn classify(&self, title: Option<&str>, caption: Option<&str>) -> Classification {
        let Some(api_key) = self.api_key.as_deref() else {
            return fallback_classify(title, caption);
        };

        match self.classify_with_model(api_key, title, caption).await {
            Some(result) => result,
            None => {
                warn!("model classification failed; using keyword fallback");
                fallback_classify(title, caption)
            }
        }
    }

    async fn classify_with_model(
        &self,
        api_key: &str,
        title: Option<&str>,
        caption: Option<&str>,
    ) -> Option<Classification> {
        let prompt = build_prompt(title, caption);
        let body = json!({
            "model": ANTHROPIC_MODEL,
            "max_tokens": 256,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(ANTHROPIC_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }

        let payload: JsonValue = response.json().await.ok()?;
        let text = payload
            .get("content")
            .and_then(JsonValue::as_array)?
            .iter()
            .find(|item| item.get("type").and_then(JsonValue::as_str) == Some("text"))?
            .get("text")
            .and_then(JsonValue::as_str)?;

        let cleaned = text.replace("```json", "").replace("```", "");
        let parsed: JsonValue = serde_json::from_str(cleaned.trim()).ok()?;
        Some(normalize_result(&parsed))
    }
}

fn build_prompt(title: Option<&str>, caption: Option<&str>) -> String {
    let caption_head: String = caption
        .unwrap_or("（なし）")
        .chars()
        .take(CAPTION_PROMPT_CHARS)
        .collect();
    format!(
        "あなたはInstagramアカウント「思考の取説ノート｜つき」の投稿シリーズ分類アシスタントです。\n\n\
## 投稿タイトル\n{}\n\n\
## キャプション（冒頭200文字）\n{}\n\n\
## シリーズ定義\n{}\n\
## コンテンツ種別定義\n{}\n\
## 出力形式（JSONのみ。説明文不要）\n\
{{\n  \"series\": \"シリーズのvalue値（例: judgment）\",\n  \"content_role\": \"template または trust\",\n  \"confidence\": 0.0,\n  \"reason\": \"20文字以内で判定理由\"\n}}\n",
        title.unwrap_or("（なし）"),
        caption_head,
        SERIES_DEFINITIONS,
        ROLE_DEFINITIONS,
    )
}

/// Deterministic keyword classification over the lowercased title+caption.
pub fn fallback_classify(title: Option<&str>, caption: Option<&str>) -> Classification {
    let text = format!("{}\n{}", title.unwrap_or(""), caption.unwrap_or("")).to_lowercase();

    let series = SERIES_RULES
        .iter()
        .find(|(rule, _)| rule.is_match(&text))
        .map(|(_, series)| *series)
        .unwrap_or(Series::Tsuki);
    let content_role = if TEMPLATE_RULE.is_match(&text) {
        ContentRole::Template
    } else {
        ContentRole::Trust
    };

    Classification {
        series,
        content_role,
        confidence: HEURISTIC_CONFIDENCE,
        reason: "heuristic".to_string(),
    }
}

/// Clamps and defaults a model response into a valid classification.
pub fn normalize_result(raw: &JsonValue) -> Classification {
    let series = raw
        .get("series")
        .and_then(JsonValue::as_str)
        .and_then(Series::parse)
        .unwrap_or(Series::Tsuki);
    let content_role = match raw.get("content_role").and_then(JsonValue::as_str) {
        Some("template") => ContentRole::Template,
        _ => ContentRole::Trust,
    };
    let confidence = raw
        .get("confidence")
        .and_then(JsonValue::as_f64)
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.5);
    let reason = raw
        .get("reason")
        .and_then(JsonValue::as_str)
        .map(|r| r.chars().take(REASON_CHAR_CAP).collect())
        .unwrap_or_else(|| "model".to_string());

    Classification {
        series,
        content_role,
        confidence,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checklist_caption_yields_template_at_fixed_confidence() {
        let result = fallback_classify(None, Some("断り方チェックリスト10選"));
        assert_eq!(result.content_role, ContentRole::Template);
        assert_eq!(result.confidence, 0.55);
        assert_eq!(result.reason, "heuristic");
    }

    #[test]
    fn first_matching_rule_wins() {
        // 恋愛 (love) and 判断 (judgment) both match; love is ranked first.
        let result = fallback_classify(Some("恋愛の判断基準"), None);
        assert_eq!(result.series, Series::Love);

        let result = fallback_classify(None, Some("先延ばしをやめる問いかけ"));
        assert_eq!(result.series, Series::Procrastination);
    }

    #[test]
    fn unmatched_text_falls_back_to_tsuki_trust() {
        let result = fallback_classify(Some("ただの日記"), Some("今日は晴れでした"));
        assert_eq!(result.series, Series::Tsuki);
        assert_eq!(result.content_role, ContentRole::Trust);
    }

    #[test]
    fn ascii_rules_match_case_insensitively() {
        let result = fallback_classify(None, Some("LINEの返信に悩む"));
        assert_eq!(result.series, Series::Distance);
    }

    #[test]
    fn normalization_clamps_and_defaults() {
        let parsed = serde_json::json!({
            "series": "not-a-series",
            "content_role": "TEMPLATE",
            "confidence": 3.2,
            "reason": "あ".repeat(80),
        });
        let result = normalize_result(&parsed);
        assert_eq!(result.series, Series::Tsuki);
        // only the exact lowercase "template" counts
        assert_eq!(result.content_role, ContentRole::Trust);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.reason.chars().count(), 50);

        let empty = normalize_result(&serde_json::json!({}));
        assert_eq!(empty.confidence, 0.5);
        assert_eq!(empty.reason, "model");
    }

    #[tokio::test]
    async fn classify_without_credential_uses_fallback() {
        let classifier = Classifier::new(None);
        let result = classifier.classify(None, Some("チェックリストで整理")).await;
        assert_eq!(result.content_role, ContentRole::Template);
        assert_eq!(result.confidence, 0.55);
    }
}
