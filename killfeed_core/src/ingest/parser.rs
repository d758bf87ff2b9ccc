use crate::ingest::models::{EventKind, ParsedEvent};
use chrono::{DateTime, NaiveDateTime, Utc};

/// A malformed kill-feed line. Counted by the engine, never propagated.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),
    #[error("unrecognized timestamp '{0}'")]
    Timestamp(String),
    #[error("unknown event kind '{0}'")]
    Kind(String),
    #[error("missing {0} name")]
    MissingName(&'static str),
    #[error("invalid distance '{0}'")]
    Distance(String),
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const GAME_FORMAT: &str = "%Y.%m.%d-%H.%M.%S";

/// Parse one line. Blank lines and the CSV header yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ParsedEvent>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.to_ascii_lowercase().starts_with("timestamp") {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let timestamp = parse_timestamp(fields[0])?;
    let mut kind = match fields[1].to_ascii_lowercase().as_str() {
        "kill" => EventKind::Kill,
        "death" => EventKind::Death,
        "suicide" => EventKind::Suicide,
        other => return Err(ParseError::Kind(other.to_string())),
    };
    let actor = fields[2];
    let target = fields[3];
    let weapon = fields[4];
    let distance = parse_distance(fields.get(5).copied().unwrap_or(""))?;

    if actor.is_empty() {
        return Err(ParseError::MissingName("actor"));
    }
    if kind == EventKind::Kill {
        if target.is_empty() {
            return Err(ParseError::MissingName("target"));
        }
        if actor == target {
            kind = EventKind::Suicide;
        }
    }

    Ok(Some(ParsedEvent {
        timestamp,
        kind,
        actor: actor.to_string(),
        target: target.to_string(),
        weapon: weapon.to_string(),
        distance,
    }))
}

/// Accepts RFC 3339, ISO-like naive timestamps (UTC), and `YYYY.MM.DD-HH.MM.SS[:fff]`.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(ts.and_utc());
        }
    }
    parse_game_timestamp(raw).ok_or_else(|| ParseError::Timestamp(raw.to_string()))
}

fn parse_game_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let (base, millis) = match raw.split_once(':') {
        Some((base, ms)) => (base, ms.parse::<i64>().ok()?),
        None => (raw, 0),
    };
    let ts = NaiveDateTime::parse_from_str(base, GAME_FORMAT).ok()?;
    Some((ts + chrono::Duration::milliseconds(millis)).and_utc())
}

fn parse_distance(raw: &str) -> Result<f64, ParseError> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    let value = raw
        .trim_end_matches('m')
        .parse::<f64>()
        .map_err(|_| ParseError::Distance(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::Distance(raw.to_string()));
    }
    Ok(value)
}
