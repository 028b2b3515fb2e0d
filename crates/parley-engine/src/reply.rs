//! Pending-reply marker and reply validation.

use std::sync::LazyLock;

use parley_types::{Context, EventKind, InboundEvent, ParleyError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

use crate::definition::Patterns;

pub const PENDING_REPLY_KEY: &str = "_pending_reply";

/// What a question step accepts as an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReply {
    #[default]
    Text,
    Email,
    Number,
    ReplyId,
    Image,
    Location,
    Form,
}

impl ExpectedReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectedReply::Text => "text",
            ExpectedReply::Email => "email",
            ExpectedReply::Number => "number",
            ExpectedReply::ReplyId => "reply_id",
            ExpectedReply::Image => "image",
            ExpectedReply::Location => "location",
            ExpectedReply::Form => "form",
        }
    }
}

/// Written into the context when a question is asked, removed once a valid
/// answer has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReply {
    pub variable: String,
    #[serde(default)]
    pub expected: ExpectedReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub step: String,
}

impl PendingReply {
    pub fn read(context: &Context) -> Option<PendingReply> {
        let raw = context.get(PENDING_REPLY_KEY)?;
        match serde_json::from_value(raw.clone()) {
            Ok(marker) => Some(marker),
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring malformed pending-reply marker");
                None
            }
        }
    }

    pub fn write(&self, context: &mut Context) {
        let value = json!({
            "variable": self.variable,
            "expected": self.expected,
            "pattern": self.pattern,
            "step": self.step,
        });
        context.set(PENDING_REPLY_KEY, value);
    }

    pub fn clear(context: &mut Context) -> Option<Value> {
        context.remove(PENDING_REPLY_KEY)
    }

    pub fn is_pending(context: &Context) -> bool {
        context.contains(PENDING_REPLY_KEY)
    }
}

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@.]+(?:\.[^\s@.]+)+$").expect("email regex is valid"));

fn reject(marker: &PendingReply, reason: impl Into<String>) -> ParleyError {
    ParleyError::ReplyRejected {
        variable: marker.variable.clone(),
        reason: reason.into(),
    }
}

fn check_pattern(marker: &PendingReply, patterns: &Patterns, raw: &str) -> Result<()> {
    let Some(pattern) = marker.pattern.as_deref() else {
        return Ok(());
    };
    let re = patterns
        .compile(pattern)
        .map_err(|e| reject(marker, format!("invalid validation pattern: {e}")))?;
    if re.is_match(raw) {
        Ok(())
    } else {
        Err(reject(marker, format!("'{raw}' does not match {pattern}")))
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    raw.replace(',', ".")
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn required_text<'a>(marker: &PendingReply, event: &'a InboundEvent) -> Result<&'a str> {
    let text = event.text_body().trim();
    if text.is_empty() {
        return Err(reject(
            marker,
            format!(
                "expected {}, got an empty {} event",
                marker.expected.as_str(),
                event.kind.as_str()
            ),
        ));
    }
    Ok(text)
}

/// Validate `event` against the marker, returning the value to store.
/// `patterns` supplies the flow's precompiled validation patterns.
pub fn validate_reply(marker: &PendingReply, patterns: &Patterns, event: &InboundEvent) -> Result<Value> {
    match marker.expected {
        ExpectedReply::Text => {
            let text = required_text(marker, event)?;
            check_pattern(marker, patterns, text)?;
            Ok(Value::String(text.to_string()))
        }
        ExpectedReply::Email => {
            let text = required_text(marker, event)?;
            if !EMAIL.is_match(text) {
                return Err(reject(marker, format!("'{text}' is not an email address")));
            }
            check_pattern(marker, patterns, text)?;
            Ok(Value::String(text.to_lowercase()))
        }
        ExpectedReply::Number => {
            let text = required_text(marker, event)?;
            check_pattern(marker, patterns, text)?;
            parse_number(text).ok_or_else(|| reject(marker, format!("'{text}' is not a number")))
        }
        ExpectedReply::ReplyId => {
            let reply_id = event
                .reply_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| reject(marker, "expected a chosen reply"))?;
            check_pattern(marker, patterns, reply_id)?;
            Ok(Value::String(reply_id.to_string()))
        }
        ExpectedReply::Image => match (&event.kind, &event.media) {
            (EventKind::Image, Some(media)) => Ok(serde_json::to_value(media)?),
            _ => Err(reject(marker, "expected an image")),
        },
        ExpectedReply::Location => match &event.location {
            Some(point) => Ok(json!({"latitude": point.latitude, "longitude": point.longitude})),
            None => Err(reject(marker, "expected a location")),
        },
        ExpectedReply::Form => match &event.form {
            Some(payload) if !payload.is_null() => Ok(payload.clone()),
            _ => Err(reject(marker, "expected a form response")),
        },
    }
}
