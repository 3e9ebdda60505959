//! Cron evaluation: validation, description, next-fire computation, presets.
//!
//! Expressions are classic 5-field (`m h dom mon dow`) with `* , - /` and
//! numeric weekdays 0-6 where 0 is Sunday. The `cron` crate expects a seconds
//! field and counts weekdays 1-7 from Sunday, so expressions are normalized
//! before parsing. Evaluation happens in the configured local timezone; the
//! crate applies civil-time DST rules (skipped instants fire at the next
//! valid instant, repeated instants fire once).

use chrono::{DateTime, Local};
use cron::Schedule;
use rand::Rng;
use serde::Serialize;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// A named schedule preset offered by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct CronPreset {
    pub name: &'static str,
    pub expr: &'static str,
    pub description: String,
}

/// Parse a 5-field expression into a `Schedule`.
pub fn parse(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(AppError::InvalidCron(format!(
            "expected 5 fields, got {}",
            fields.len()
        )));
    }

    let normalized = format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        normalize_dow(fields[4])?
    );

    Schedule::from_str(&normalized).map_err(|e| AppError::InvalidCron(e.to_string()))
}

/// Validate an expression, returning its human description.
pub fn validate(expr: &str) -> Result<String> {
    parse(expr)?;
    Ok(describe(expr))
}

/// Next fire strictly after `from`, in local civil time.
pub fn next_fire(expr: &str, from: DateTime<Local>) -> Result<DateTime<Local>> {
    let schedule = parse(expr)?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| AppError::InvalidCron("expression never fires".into()))
}

/// Generate a randomized expression for a coarse pattern, spreading load
/// across the hour or day.
pub fn random_from_pattern(pattern: &str) -> Result<String> {
    let mut rng = rand::thread_rng();
    let minute = rng.gen_range(0..60);
    match pattern {
        "hourly" => Ok(format!("{minute} * * * *")),
        "daily" => {
            let hour = rng.gen_range(0..24);
            Ok(format!("{minute} {hour} * * *"))
        }
        "night" => {
            let hour = rng.gen_range(1..=6);
            Ok(format!("{minute} {hour} * * *"))
        }
        other => Err(AppError::InvalidCron(format!("unknown pattern '{other}'"))),
    }
}

/// Presets offered in the task editor.
pub fn presets() -> Vec<CronPreset> {
    [
        ("every-5-min", "*/5 * * * *"),
        ("every-15-min", "*/15 * * * *"),
        ("hourly", "0 * * * *"),
        ("daily-3am", "0 3 * * *"),
        ("weekly-sunday", "0 3 * * 0"),
        ("workdays-2am", "0 2 * * 1-5"),
    ]
    .into_iter()
    .map(|(name, expr)| CronPreset {
        name,
        expr,
        description: describe(expr),
    })
    .collect()
}

/// Remap the day-of-week field from 0-6 (0 = Sunday) to the parser's 1-7
/// (1 = Sunday), token by token. `7` is accepted as a Sunday alias.
fn normalize_dow(field: &str) -> Result<String> {
    fn map_num(text: &str) -> Result<String> {
        // Named days pass through untouched.
        if text.chars().any(|c| c.is_ascii_alphabetic()) {
            return Ok(text.to_string());
        }
        let n: u8 = text
            .parse()
            .map_err(|_| AppError::InvalidCron(format!("bad weekday '{text}'")))?;
        if n > 7 {
            return Err(AppError::InvalidCron(format!("weekday {n} out of range")));
        }
        Ok(((n % 7) + 1).to_string())
    }

    let mut tokens = Vec::new();
    for token in field.split(',') {
        let (base, step) = match token.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (token, None),
        };

        let mapped_base = if base == "*" {
            base.to_string()
        } else if let Some((lo, hi)) = base.split_once('-') {
            format!("{}-{}", map_num(lo)?, map_num(hi)?)
        } else {
            map_num(base)?
        };

        tokens.push(match step {
            Some(step) => format!("{mapped_base}/{step}"),
            None => mapped_base,
        });
    }
    Ok(tokens.join(","))
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Best-effort English description of a 5-field expression.
pub fn describe(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return expr.to_string();
    }
    let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

    let mut parts = Vec::new();

    // Minute phrase.
    if let Some(step) = minute.strip_prefix("*/") {
        parts.push(format!("every {step} minutes"));
    } else if minute == "*" {
        parts.push("every minute".to_string());
    } else {
        parts.push(format!("at minute {minute}"));
    }

    // Hour phrase.
    if let Some(step) = hour.strip_prefix("*/") {
        parts.push(format!("every {step} hours"));
    } else if let Some((lo, hi)) = hour.split_once('-') {
        parts.push(format!("between {lo:0>2}:00 and {hi:0>2}:59"));
    } else if hour != "*" {
        parts.push(format!("past {hour:0>2}:00"));
    }

    // Day-of-month phrase.
    if dom != "*" {
        parts.push(format!("on day {dom} of the month"));
    }

    // Month phrase.
    if month != "*" {
        let named = month
            .split(',')
            .map(|m| {
                m.parse::<usize>()
                    .ok()
                    .and_then(|n| MONTH_NAMES.get(n.wrapping_sub(1)))
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| m.to_string())
            })
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("in {named}"));
    }

    // Day-of-week phrase (0 = Sunday).
    if dow != "*" {
        parts.push(format!("on {}", describe_dow(dow)));
    }

    parts.join(", ")
}

fn describe_dow(field: &str) -> String {
    fn name(text: &str) -> String {
        text.parse::<usize>()
            .ok()
            .and_then(|n| DAY_NAMES.get(n % 7))
            .map(|s| s.to_string())
            .unwrap_or_else(|| text.to_string())
    }

    field
        .split(',')
        .map(|token| match token.split_once('-') {
            Some((lo, hi)) => format!("{}-{}", name(lo), name(hi)),
            None => name(token),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
