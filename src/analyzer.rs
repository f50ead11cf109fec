//! Content analysis: model-backed verification with a heuristic fallback.
//!
//! [`analyze`] is the single entry point. With the `"model"` provider it
//! prompts the configured language-model endpoint and parses a JSON verdict
//! out of the response text; with `"heuristic"` (or when no endpoint is
//! configured) it scores content with a deterministic lexical heuristic.
//!
//! Malformed model output never propagates as a parse error — the analyzer
//! falls back to the heuristic scorer and tags the verdict accordingly.
//! Every [`Verdict`] carries its provenance (`model` vs `heuristic`) so
//! callers can tell degraded-mode output from the real thing.
//!
//! Transport-level failures are NOT handled here: HTTP 429, timeouts, and
//! 5xx surface as typed [`WorkerError`]s for the central error handler to
//! classify. The analyzer performs no retries of its own.
//!
//! Risk mapping from accuracy is fixed at the product level
//! (`>90 low, 80–90 medium, 70–80 high, <70 critical`) and is always
//! recomputed here — a model-reported risk level is ignored.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::config::AnalyzerConfig;
use crate::failure::WorkerError;
use crate::models::{Flag, RiskLevel, Verdict, VerdictSource};

/// Environment variable holding the model endpoint API key.
pub const API_KEY_ENV: &str = "VERITOR_API_KEY";

/// Lexical patterns the heuristic scorer treats as overconfidence signals.
/// Each match flags a span and deducts a bounded penalty from the base score.
const OVERCONFIDENCE_PATTERNS: &[(&str, &str)] = &[
    ("definitely", "absolute-certainty phrasing"),
    ("absolutely certain", "absolute-certainty phrasing"),
    ("without a doubt", "absolute-certainty phrasing"),
    ("undeniable", "absolute-certainty phrasing"),
    ("guaranteed", "absolute-certainty phrasing"),
    ("100% accurate", "impossible precision"),
    ("100% certain", "impossible precision"),
    ("always true", "universal claim"),
    ("never fails", "universal claim"),
    ("scientifically proven", "unsupported appeal to proof"),
    ("it is a fact that", "assertion without source"),
    ("everyone knows", "unsupported consensus claim"),
];

/// Per-call options. Overrides the config defaults where set.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
}

/// Analyze a document and return a structured verdict.
///
/// Content must be non-empty; content beyond the configured context limit
/// is truncated, never rejected.
pub async fn analyze(
    cfg: &AnalyzerConfig,
    content: &str,
    opts: &AnalysisOptions,
) -> Result<Verdict, WorkerError> {
    if content.trim().is_empty() {
        return Err(WorkerError::Validation(
            "document content is empty".to_string(),
        ));
    }

    let content = truncate_to_chars(content, cfg.max_content_chars);
    let started = Instant::now();

    if !cfg.model_enabled() {
        return Ok(heuristic_verdict(content, started.elapsed().as_millis() as i64));
    }

    let text = call_model(cfg, content, opts).await?;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    match parse_verdict_text(&text) {
        Ok(parsed) => {
            let accuracy = parsed.accuracy.clamp(0.0, 100.0);
            Ok(Verdict {
                accuracy,
                risk_level: RiskLevel::from_accuracy(accuracy),
                flags: parsed.flags,
                verification_sources: parsed.verification_sources,
                processing_time_ms: elapsed_ms,
                source: VerdictSource::Model,
            })
        }
        Err(reason) => {
            tracing::warn!(%reason, "Model verdict unparseable, using heuristic fallback");
            Ok(heuristic_verdict(content, elapsed_ms))
        }
    }
}

/// Call the model endpoint and return the raw response text.
///
/// Transport failures map to the failure taxonomy:
/// - HTTP 429 → throttled
/// - HTTP 401/403 → authorization
/// - HTTP 5xx and network errors → service unavailable
/// - client timeout → timeout
async fn call_model(
    cfg: &AnalyzerConfig,
    content: &str,
    opts: &AnalysisOptions,
) -> Result<String, WorkerError> {
    let endpoint = cfg
        .endpoint
        .as_deref()
        .ok_or_else(|| WorkerError::Other("analyzer endpoint not configured".to_string()))?;

    let api_key = std::env::var(API_KEY_ENV)
        .map_err(|_| WorkerError::Authorization(format!("{} not set", API_KEY_ENV)))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .build()
        .map_err(|e| WorkerError::Other(format!("failed to build http client: {}", e)))?;

    let body = serde_json::json!({
        "prompt": build_prompt(content),
        "model": cfg.model,
        "max_tokens": opts.max_tokens.unwrap_or(cfg.max_tokens),
        "temperature": opts.temperature.unwrap_or(cfg.temperature),
    });

    let resp = client
        .post(endpoint)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                WorkerError::Timeout(format!("model endpoint timed out: {}", e))
            } else {
                WorkerError::Unavailable(format!("model endpoint unreachable: {}", e))
            }
        })?;

    let status = resp.status();
    if status.is_success() {
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| WorkerError::Unavailable(format!("bad model response body: {}", e)))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        return Ok(text);
    }

    let body_text = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        429 => Err(WorkerError::Throttled(format!(
            "model endpoint rate limited: {}",
            body_text
        ))),
        401 | 403 => Err(WorkerError::Authorization(format!(
            "model endpoint rejected credentials ({}): {}",
            status, body_text
        ))),
        s if status.is_server_error() => Err(WorkerError::Unavailable(format!(
            "model endpoint error {}: {}",
            s, body_text
        ))),
        s => Err(WorkerError::Other(format!(
            "model endpoint error {}: {}",
            s, body_text
        ))),
    }
}

fn build_prompt(content: &str) -> String {
    format!(
        "You are a content-verification engine. Analyze the document below for \
         factual accuracy and hallucination risk. Respond with ONLY a JSON object:\n\
         {{\"accuracy\": <0-100>, \"flags\": [{{\"excerpt\": \"...\", \"reason\": \"...\"}}], \
         \"verification_sources\": <int>}}\n\n\
         Document:\n{}",
        content
    )
}

struct ParsedVerdict {
    accuracy: f64,
    flags: Vec<Flag>,
    verification_sources: i64,
}

/// Parse a JSON verdict out of model response text.
///
/// Tolerates surrounding prose and markdown code fences by extracting the
/// outermost `{ ... }` object before parsing.
fn parse_verdict_text(text: &str) -> Result<ParsedVerdict, String> {
    let json_str = extract_json_object(text).ok_or("no JSON object in model output")?;

    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| format!("invalid JSON verdict: {}", e))?;

    let accuracy = json
        .get("accuracy")
        .and_then(|v| v.as_f64())
        .ok_or("verdict missing numeric accuracy")?;

    let verification_sources = json
        .get("verification_sources")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let flags = json
        .get("flags")
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| {
                    if let Some(s) = item.as_str() {
                        return Some(Flag {
                            excerpt: s.to_string(),
                            reason: "flagged by model".to_string(),
                        });
                    }
                    let excerpt = item.get("excerpt")?.as_str()?.to_string();
                    let reason = item
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("flagged by model")
                        .to_string();
                    Some(Flag { excerpt, reason })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ParsedVerdict {
        accuracy,
        flags,
        verification_sources,
    })
}

/// Extract the outermost JSON object from free-form model text.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Deterministic lexical scorer used when the model is unavailable or its
/// output is unparseable. Flags a fixed set of overconfidence patterns; each
/// match deducts a randomized-but-bounded penalty from a base score in
/// `[85, 95]`. The verdict is tagged `heuristic` so it is never mistaken for
/// model output.
pub fn heuristic_verdict(content: &str, elapsed_ms: i64) -> Verdict {
    let mut rng = rand::thread_rng();
    let lower = content.to_lowercase();

    let mut accuracy: f64 = rng.gen_range(85.0..=95.0);
    let mut flags = Vec::new();

    for (pattern, reason) in OVERCONFIDENCE_PATTERNS {
        if let Some(pos) = lower.find(pattern) {
            let penalty: f64 = rng.gen_range(3.0..=8.0);
            accuracy -= penalty;
            flags.push(Flag {
                excerpt: excerpt_around(&lower, pos, pattern.len()),
                reason: (*reason).to_string(),
            });
        }
    }

    let accuracy = accuracy.clamp(0.0, 100.0);

    Verdict {
        accuracy,
        risk_level: RiskLevel::from_accuracy(accuracy),
        flags,
        verification_sources: 0,
        processing_time_ms: elapsed_ms,
        source: VerdictSource::Heuristic,
    }
}

/// Take a short context window around a match, staying on char boundaries.
fn excerpt_around(text: &str, pos: usize, match_len: usize) -> String {
    let mut start = pos.saturating_sub(20);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (pos + match_len + 20).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[start..end].trim().to_string()
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate_to_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[tokio::test]
    async fn empty_content_is_a_validation_error() {
        let cfg = AnalyzerConfig::default();
        let err = analyze(&cfg, "   \n ", &AnalysisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)));
    }

    #[tokio::test]
    async fn heuristic_provider_scores_clean_content_high() {
        let cfg = AnalyzerConfig::default();
        let verdict = analyze(
            &cfg,
            "The committee reviewed several sources and found the figures plausible.",
            &AnalysisOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(verdict.source, VerdictSource::Heuristic);
        assert!(verdict.flags.is_empty());
        assert!((85.0..=95.0).contains(&verdict.accuracy));
        assert_eq!(verdict.risk_level, RiskLevel::from_accuracy(verdict.accuracy));
    }

    #[tokio::test]
    async fn heuristic_flags_overconfident_phrasing() {
        let cfg = AnalyzerConfig::default();
        let verdict = analyze(
            &cfg,
            "This is definitely correct, scientifically proven, and 100% accurate.",
            &AnalysisOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(verdict.source, VerdictSource::Heuristic);
        assert!(verdict.flags.len() >= 3, "flags: {:?}", verdict.flags);
        // Base at most 95, at least 3 matches × at least 3 points each
        assert!(verdict.accuracy <= 95.0 - 9.0);
        assert!(verdict.accuracy >= 0.0);
    }

    #[tokio::test]
    async fn oversized_content_is_truncated_not_rejected() {
        let cfg = AnalyzerConfig {
            max_content_chars: 100,
            ..AnalyzerConfig::default()
        };
        let big = "plain factual sentence. ".repeat(10_000);
        let verdict = analyze(&cfg, &big, &AnalysisOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.source, VerdictSource::Heuristic);
    }

    #[test]
    fn parses_clean_json_verdict() {
        let parsed = parse_verdict_text(
            r#"{"accuracy": 87.5, "flags": [{"excerpt": "always wins", "reason": "universal claim"}], "verification_sources": 4}"#,
        )
        .unwrap();
        assert_eq!(parsed.accuracy, 87.5);
        assert_eq!(parsed.flags.len(), 1);
        assert_eq!(parsed.flags[0].reason, "universal claim");
        assert_eq!(parsed.verification_sources, 4);
    }

    #[test]
    fn parses_fenced_json_verdict() {
        let text = "Here is my analysis:\n```json\n{\"accuracy\": 42, \"flags\": [\"dubious claim\"]}\n```\nDone.";
        let parsed = parse_verdict_text(text).unwrap();
        assert_eq!(parsed.accuracy, 42.0);
        assert_eq!(parsed.flags.len(), 1);
        assert_eq!(parsed.flags[0].excerpt, "dubious claim");
    }

    #[test]
    fn rejects_output_without_verdict() {
        assert!(parse_verdict_text("I could not analyze this document.").is_err());
        assert!(parse_verdict_text("{\"confidence\": 1}").is_err());
        assert!(parse_verdict_text("{not json at all}").is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld, this is multibyte content";
        let t = truncate_to_chars(s, 8);
        assert_eq!(t.chars().count(), 8);
    }
}
