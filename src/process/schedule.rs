use crate::error::{Result, VigilError};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Fires once per instant matched by a cron expression
#[derive(Debug, Clone)]
pub struct ScheduleTrigger<Tz: TimeZone = Utc> {
    expression: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Tz>>,
}

impl<Tz: TimeZone> ScheduleTrigger<Tz> {
    /// Parse `expression` and compute the first fire strictly after `now`
    pub fn new(expression: &str, now: &DateTime<Tz>) -> Result<Self> {
        let normalized = normalize_cron_expr(expression);
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            VigilError::InvalidScheduleExpression(expression.to_string(), e.to_string())
        })?;
        let next_fire = schedule.after(now).next();

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            next_fire,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next matching instant strictly after `now`
    pub fn next_fire_after(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(now).next()
    }

    pub fn next_fire(&self) -> Option<&DateTime<Tz>> {
        self.next_fire.as_ref()
    }

    /// True once when a scheduled instant has been reached
    ///
    /// Instants missed between two polls collapse into a single fire.
    pub fn poll_due(&mut self, now: &DateTime<Tz>) -> bool {
        let due = matches!(self.next_fire, Some(ref next) if next <= now);
        if due {
            self.next_fire = self.next_fire_after(now);
        }
        due
    }
}

/// Accept standard 5-field cron ("m h dom mon dow") by prepending seconds=0
///
/// Six and seven field expressions are passed through in the `cron` crate's
/// own syntax.
fn normalize_cron_expr(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            parts[0],
            parts[1],
            parts[2],
            parts[3],
            remap_day_of_week(parts[4])
        )
    } else {
        expr.to_string()
    }
}

/// Standard cron counts weekdays from Sunday = 0 (7 is Sunday too),
/// the `cron` crate from Sunday = 1
///
/// Numeric items are expanded to an explicit list in the crate's numbering.
/// Names (`MON-FRI`) and anything unparseable are left for the crate to judge.
fn remap_day_of_week(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }

    let mut items = Vec::new();
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        match standard_days(item) {
            Some(expanded) => days.extend(expanded),
            None => items.push(item.to_string()),
        }
    }

    items.extend(days.into_iter().map(|day| (day + 1).to_string()));
    items.join(",")
}

/// Days (0 = Sunday) named by one numeric list item such as `3`, `1-5`,
/// `*/2` or `1-7/3`
fn standard_days(item: &str) -> Option<Vec<u32>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
        None => (item, 1),
    };

    let (start, end) = if range == "*" {
        (0, 6)
    } else if let Some((start, end)) = range.split_once('-') {
        (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?)
    } else {
        let day = range.parse::<u32>().ok()?;
        // `5/2` runs from 5 to the end of the week
        if step > 1 {
            (day, 7)
        } else {
            (day, day)
        }
    };

    if start > end || end > 7 {
        return None;
    }

    Some((start..=end).step_by(step).map(|day| day % 7).collect())
}
