//! Text rendering of remote values, local literals, and identifiers.

use std::borrow::Cow;

use cass_store::RemoteValue;
use chrono::{DateTime, NaiveDate};
use datafusion::common::ScalarValue;
use tracing::debug;
use uuid::Uuid;

use crate::relation::LocalType;

/// Placeholder rendered for remote values without a local text form.
pub const UNHANDLED_TYPE: &str = "<unhandled type>";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Renders a remote value as text. Remote nulls yield `None`.
///
/// Collections and other composite values degrade to [`UNHANDLED_TYPE`]
/// instead of failing the row.
pub fn remote_to_text(value: &RemoteValue) -> Option<Cow<'_, str>> {
    let text = match value {
        RemoteValue::Null => return None,
        RemoteValue::Int32(value) => Cow::Owned(value.to_string()),
        RemoteValue::Int64(value) => Cow::Owned(value.to_string()),
        RemoteValue::Boolean(value) => Cow::Borrowed(if *value { "true" } else { "false" }),
        RemoteValue::Double(value) => Cow::Owned(value.to_string()),
        RemoteValue::Text(value) => Cow::Borrowed(value.as_str()),
        RemoteValue::Uuid(value) => Cow::Owned(value.hyphenated().to_string()),
        RemoteValue::Timestamp(millis) => match DateTime::from_timestamp_millis(*millis) {
            Some(at) => Cow::Owned(at.naive_utc().format(TIMESTAMP_FORMAT).to_string()),
            None => {
                debug!(millis, "remote timestamp out of range");
                Cow::Borrowed(UNHANDLED_TYPE)
            }
        },
        RemoteValue::Unsupported(ty) => {
            debug!(remote_type = %ty, "remote value has no local rendering");
            Cow::Borrowed(UNHANDLED_TYPE)
        }
    };
    Some(text)
}

/// Renders a constant as a remote query literal for a column of `ty`.
///
/// Quoted types get single quotes with embedded quotes doubled; everything
/// else uses its canonical text form. Returns `None` when the constant has
/// no literal form.
pub fn format_literal(value: &ScalarValue, ty: LocalType) -> Option<String> {
    if value.is_null() {
        return Some("NULL".to_string());
    }
    let text = scalar_text(value)?;
    if ty == LocalType::Uuid {
        // Bare in the remote grammar, so only a well-formed uuid is rendered.
        return Uuid::parse_str(text.trim())
            .ok()
            .map(|id| id.hyphenated().to_string());
    }
    Some(if ty.is_quoted_literal() {
        quote_literal(&text)
    } else {
        text
    })
}

fn scalar_text(value: &ScalarValue) -> Option<String> {
    Some(match value {
        ScalarValue::Boolean(Some(value)) => value.to_string(),
        ScalarValue::Int8(Some(value)) => value.to_string(),
        ScalarValue::Int16(Some(value)) => value.to_string(),
        ScalarValue::Int32(Some(value)) => value.to_string(),
        ScalarValue::Int64(Some(value)) => value.to_string(),
        ScalarValue::UInt8(Some(value)) => value.to_string(),
        ScalarValue::UInt16(Some(value)) => value.to_string(),
        ScalarValue::UInt32(Some(value)) => value.to_string(),
        ScalarValue::UInt64(Some(value)) => value.to_string(),
        ScalarValue::Float32(Some(value)) => value.to_string(),
        ScalarValue::Float64(Some(value)) => value.to_string(),
        ScalarValue::Utf8(Some(value))
        | ScalarValue::LargeUtf8(Some(value))
        | ScalarValue::Utf8View(Some(value)) => value.clone(),
        ScalarValue::Date32(Some(days)) => NaiveDate::default()
            .checked_add_signed(chrono::TimeDelta::try_days(i64::from(*days))?)?
            .format("%Y-%m-%d")
            .to_string(),
        ScalarValue::TimestampNanosecond(Some(nanos), None) => DateTime::from_timestamp_nanos(*nanos)
            .naive_utc()
            .format(TIMESTAMP_FORMAT)
            .to_string(),
        _ => return None,
    })
}

fn quote_literal(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for ch in text.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Double-quotes an identifier unless it is a plain lower-case name.
pub fn quote_identifier(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        return Cow::Borrowed(name);
    }
    Cow::Owned(format!("\"{}\"", name.replace('"', "\"\"")))
}
