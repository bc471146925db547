//! Interpreting raw grading-collaborator output as a score/feedback pair.

use serde_json::Value;
use thiserror::Error;

use crate::tutor::types::Grade;

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("grader unavailable: {0}")]
    Unavailable(String),
    #[error("grading timed out after {0} ms")]
    TimedOut(u64),
    #[error("unparseable grading response")]
    Unparseable { raw: String },
}

impl GradingError {
    /// Text recorded as feedback when the attempt is scored 0.
    pub fn feedback(&self) -> String {
        match self {
            Self::Unparseable { raw } => raw.clone(),
            other => other.to_string(),
        }
    }

    pub fn into_grade(self) -> Grade {
        Grade::failed(self.feedback())
    }
}

/// Strips a surrounding markdown code fence, if any.
pub fn clean_json_block(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Scores above 1.0 are read as a 0-10 scale.
pub fn normalize_score(raw: f64) -> f64 {
    let score = if raw > 1.0 { raw / 10.0 } else { raw };
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn parse_grading_response(raw: &str) -> Result<Grade, GradingError> {
    let unparseable = || GradingError::Unparseable {
        raw: raw.to_string(),
    };

    let parsed: Value = serde_json::from_str(clean_json_block(raw))
        .or_else(|_| extract_object(raw).ok_or(()))
        .map_err(|_| unparseable())?;

    let object = match parsed {
        Value::Object(map) => map,
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => map,
            _ => return Err(unparseable()),
        },
        _ => return Err(unparseable()),
    };

    let score = match object.get("score") {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(unparseable)?,
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| unparseable())?,
        None => 0.0,
        _ => return Err(unparseable()),
    };

    let feedback = match object.get("feedback") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Ok(Grade {
        score: normalize_score(score),
        feedback,
    })
}

/// Last-resort recovery of a JSON object embedded in prose.
fn extract_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}
