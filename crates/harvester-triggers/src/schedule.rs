//! Cron expression handling on top of the `cron` crate.
//!
//! The `cron` crate wants a seconds field first. Classic five-field
//! expressions (`min hour dom month dow`) are accepted and get a `0` seconds
//! field prepended. Their numeric day-of-week values follow classic cron
//! (0 or 7 is Sunday, 1 is Monday) and are rewritten as day names, because
//! the `cron` crate counts from 1 = Sunday. Fire times are computed in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Result, TriggerError};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Canonical form of `expr`: single spaces, seconds field always present.
pub fn normalize(expr: &str) -> String {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields[4] = classic_day_of_week(&fields[4]);
        fields.insert(0, "0".to_string());
    }
    fields.join(" ")
}

/// Rewrite a classic day-of-week field into day names.
fn classic_day_of_week(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }
    let mut parts: Vec<String> = Vec::new();
    for part in field.split(',').flat_map(classic_day_item) {
        if !parts.contains(&part) {
            parts.push(part);
        }
    }
    parts.join(",")
}

/// One list item: `n`, `a-b`, `*` or either of those with `/step`. Items
/// that use names or are out of range are left for the parser to judge.
fn classic_day_item(item: &str) -> Vec<String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (base, Some(step)),
            _ => return vec![item.to_string()],
        },
        None => (item, None),
    };

    let bounds = if base == "*" {
        Some((0, 6))
    } else if let Some((a, b)) = base.split_once('-') {
        a.parse::<usize>().ok().zip(b.parse::<usize>().ok())
    } else {
        base.parse::<usize>()
            .ok()
            .map(|n| (n, if step.is_some() { 6 } else { n }))
    };
    let Some((start, end)) = bounds.filter(|(a, b)| a <= b && *b <= 7) else {
        return vec![item.to_string()];
    };

    (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|day| DAY_NAMES[day % 7].to_string())
        .collect()
}

pub fn parse(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr);
    Schedule::from_str(&normalized).map_err(|e| TriggerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First fire strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
