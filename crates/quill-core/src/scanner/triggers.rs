//! Trigger spec parsing and due-time evaluation.
//!
//! Triggers are textual rules on a document's agent entries. Evaluation is
//! against the local clock; `manual` and `on_save` never fire here.

use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike, Weekday};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSpec {
    /// `daily@HH:MM` — once per day after the given wall-clock time.
    Daily(NaiveTime),
    /// `weekly@<day>` — once per week on the named day.
    Weekly(Weekday),
    /// `hourly` — once per wall-clock hour.
    Hourly,
    /// Fires only on explicit request.
    Manual,
    /// Advanced by the editor client on document save.
    OnSave,
}

impl TriggerSpec {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        match spec {
            "hourly" => return Some(Self::Hourly),
            "manual" => return Some(Self::Manual),
            "on_save" => return Some(Self::OnSave),
            _ => {}
        }

        if let Some(time) = spec.strip_prefix("daily@") {
            let time = NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()?;
            return Some(Self::Daily(time));
        }
        if let Some(day) = spec.strip_prefix("weekly@") {
            return parse_weekday(day.trim()).map(Self::Weekly);
        }
        None
    }

    /// Whether the trigger is due at `now` given the recorded last run.
    pub fn is_due(&self, last_run: Option<DateTime<Local>>, now: DateTime<Local>) -> bool {
        match self {
            Self::Daily(at) => {
                if now.time() < *at {
                    return false;
                }
                let today_at = now.date_naive().and_time(*at);
                match last_run {
                    None => true,
                    Some(last) => last.naive_local() < today_at,
                }
            }
            Self::Weekly(day) => {
                if now.weekday() != *day {
                    return false;
                }
                match last_run {
                    None => true,
                    Some(last) => last.date_naive() < now.date_naive(),
                }
            }
            Self::Hourly => match last_run {
                None => true,
                Some(last) => {
                    last.date_naive() != now.date_naive() || last.hour() != now.hour()
                }
            },
            Self::Manual | Self::OnSave => false,
        }
    }
}

fn parse_weekday(day: &str) -> Option<Weekday> {
    match day.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}
