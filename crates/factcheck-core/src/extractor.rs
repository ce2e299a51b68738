//! Claim extraction from reporting channels (meetings, documents).
//!
//! Extraction is best-effort: each sentence-like unit is offered to a
//! [`ClaimMatcher`]; units without a `(metric, value)` match are skipped.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use uuid::Uuid;

use crate::config::ClaimRule;
use crate::types::{normalize_metric, Claim, Observation};

/// A metric/value pair recognised in a unit of text.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricMatch {
    pub metric: String,
    pub value: f64,
}

/// Pluggable matching strategy (rules, a model call, ...).
pub trait ClaimMatcher: Send + Sync {
    fn match_text(&self, text: &str) -> Option<MetricMatch>;
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:^|[^0-9A-Za-z.,])(?P<cur>[$€£¥])?\s?(?P<num>\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)\s?(?P<suf>[A-Za-z]+|万|亿|%)?",
        )
        .expect("number pattern is valid")
    })
}

fn period_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[^0-9A-Za-z])(?P<p>q[1-4]|h[12]|fy\d{2,4})(?:[^0-9A-Za-z]|$)")
            .expect("period pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct NumberToken {
    start: usize,
    value: f64,
}

fn scale_for(suffix: Option<&str>) -> f64 {
    match suffix.map(|s| s.to_lowercase()).as_deref() {
        Some("k") | Some("thousand") => 1e3,
        Some("m") | Some("mm") | Some("million") => 1e6,
        Some("b") | Some("bn") | Some("billion") => 1e9,
        Some("万") => 1e4,
        Some("亿") => 1e8,
        Some("%") => 0.01,
        _ => 1.0,
    }
}

fn numbers_in(text: &str) -> Vec<NumberToken> {
    number_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let num = caps.name("num")?;
            let raw: String = num.as_str().chars().filter(|c| *c != ',').collect();
            let base: f64 = raw.parse().ok()?;
            let has_currency = caps.name("cur").is_some();
            let suffix = caps.name("suf").map(|m| m.as_str());
            let scale = scale_for(suffix);
            // bare four-digit years are dates, not quantities
            let looks_like_year = !has_currency
                && scale == 1.0
                && suffix != Some("%")
                && raw.len() == 4
                && !raw.contains('.')
                && (1900.0..=2100.0).contains(&base);
            if looks_like_year {
                return None;
            }
            Some(NumberToken {
                start: num.start(),
                value: base * scale,
            })
        })
        .collect()
}

/// Keyword rules plus number parsing (currency, separators, K/M/B, 万/亿).
/// Percentages are stored as fractions, so "15%" asserts `0.15` and should be
/// checked against records kept in the same unit.
pub struct PatternMatcher {
    rules: Vec<ClaimRule>,
}

impl PatternMatcher {
    pub fn new(rules: Vec<ClaimRule>) -> Self {
        Self { rules }
    }
}

impl ClaimMatcher for PatternMatcher {
    fn match_text(&self, text: &str) -> Option<MetricMatch> {
        let lowered = text.to_lowercase();
        let numbers = numbers_in(text);
        if numbers.is_empty() {
            return None;
        }

        for rule in &self.rules {
            let Some(pos) = rule
                .keywords
                .iter()
                .filter_map(|k| lowered.find(&k.to_lowercase()))
                .min()
            else {
                continue;
            };
            // Lower-casing can shift byte offsets for non-ASCII text; the
            // positions are only used for ordering, so drift is harmless.
            let token = numbers
                .iter()
                .find(|n| n.start >= pos)
                .or_else(|| numbers.last())?;

            let metric = match period_re().captures(text).and_then(|c| c.name("p")) {
                Some(p) => format!("{} {}", p.as_str(), rule.metric),
                None => rule.metric.clone(),
            };
            return Some(MetricMatch {
                metric: normalize_metric(&metric),
                value: token.value,
            });
        }
        None
    }
}

/// Split text into sentence-like units. A '.' between digits is a decimal
/// point, not a boundary.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        let boundary = match c {
            '。' | '！' | '？' | '；' | '!' | '?' | ';' | '\n' => true,
            '.' => {
                let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
                let next_digit = chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
                !(prev_digit && next_digit)
            }
            _ => false,
        };
        if boundary {
            push_unit(&mut out, &mut current);
        } else {
            current.push(c);
        }
    }
    push_unit(&mut out, &mut current);
    out
}

fn push_unit(out: &mut Vec<String>, current: &mut String) {
    let unit = current.trim();
    if !unit.is_empty() {
        out.push(unit.to_string());
    }
    current.clear();
}

pub struct ClaimExtractor {
    matcher: Arc<dyn ClaimMatcher>,
}

impl ClaimExtractor {
    pub fn new(matcher: Arc<dyn ClaimMatcher>) -> Self {
        Self { matcher }
    }

    /// Claims asserted by a meeting or document observation. Other channels
    /// and record payloads yield nothing.
    pub fn extract(&self, observation: &Observation) -> Vec<Claim> {
        if !observation.source_channel.is_reporting() {
            return Vec::new();
        }
        let Some(text) = observation.text() else {
            return Vec::new();
        };

        split_sentences(text)
            .into_iter()
            .filter_map(|unit| {
                let m = self.matcher.match_text(&unit)?;
                Some(Claim {
                    id: Uuid::new_v4(),
                    source_observation_id: observation.id,
                    actor_id: observation.actor_id.clone(),
                    cohort_id: observation.cohort_id.clone(),
                    asserted_metric: m.metric,
                    asserted_value: m.value,
                    asserted_at: observation.timestamp,
                    statement_text: unit,
                })
            })
            .collect()
    }
}
