//! Zone configuration and the weekly schedule matching rules.

use serde::Serialize;
use time::{Duration, OffsetDateTime, Time, Weekday};

#[derive(Debug, Clone, Serialize)]
pub struct ZoneConfig {
    pub name: String,
    /// Opaque handle handed to the valve actuator (GPIO pin, MQTT device, ...).
    pub actuator: String,
    #[serde(serialize_with = "serialize_time_of_day")]
    pub schedule: Time,
    #[serde(serialize_with = "serialize_days")]
    pub days: Vec<Weekday>,
    pub duration_min: u32,
    pub enabled: bool,
    pub zone_type: String,
    pub moisture_sensor: Option<String>,
    pub flow_sensor: Option<String>,
    pub moisture_threshold: Option<f64>,
}

impl ZoneConfig {
    /// True when the zone is enabled and `weekday` is one of its watering days.
    pub fn should_run_on(&self, weekday: Weekday) -> bool {
        self.enabled && self.days.contains(&weekday)
    }

    /// The zone's scheduled instant on the calendar day of `now`.
    pub fn scheduled_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.replace_time(self.schedule)
    }

    /// Today's scheduled instant, or `None` when the zone does not run today.
    pub fn next_scheduled_at(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.should_run_on(now.weekday())
            .then(|| self.scheduled_at(now))
    }

    /// Whether `now` lies within `tolerance` of today's scheduled instant.
    pub fn is_due(&self, now: OffsetDateTime, tolerance: Duration) -> bool {
        if !self.should_run_on(now.weekday()) {
            return false;
        }
        (now - self.scheduled_at(now)).abs() <= tolerance
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a weekday tag. Case-insensitive and only the first three letters
/// count, so "mon", "MON" and "Monday" all resolve to Monday.
pub fn parse_weekday(tag: &str) -> Option<Weekday> {
    let tag = tag.trim().to_ascii_lowercase();
    let prefix = tag.get(..3)?;
    match prefix {
        "mon" => Some(Weekday::Monday),
        "tue" => Some(Weekday::Tuesday),
        "wed" => Some(Weekday::Wednesday),
        "thu" => Some(Weekday::Thursday),
        "fri" => Some(Weekday::Friday),
        "sat" => Some(Weekday::Saturday),
        "sun" => Some(Weekday::Sunday),
        _ => None,
    }
}

/// Parse a 24h "HH:MM" time of day.
pub fn parse_time_of_day(s: &str) -> Option<Time> {
    let (h, m) = s.trim().split_once(':')?;
    let hour: u8 = h.parse().ok()?;
    let minute: u8 = m.parse().ok()?;
    Time::from_hms(hour, minute, 0).ok()
}

/// Lowercase three-letter tag, e.g. "mon".
pub fn weekday_tag(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "mon",
        Weekday::Tuesday => "tue",
        Weekday::Wednesday => "wed",
        Weekday::Thursday => "thu",
        Weekday::Friday => "fri",
        Weekday::Saturday => "sat",
        Weekday::Sunday => "sun",
    }
}

/// Short display label, e.g. "Mon".
pub fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "Mon",
        Weekday::Tuesday => "Tue",
        Weekday::Wednesday => "Wed",
        Weekday::Thursday => "Thu",
        Weekday::Friday => "Fri",
        Weekday::Saturday => "Sat",
        Weekday::Sunday => "Sun",
    }
}

pub fn format_time_of_day(t: Time) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

fn serialize_time_of_day<S: serde::Serializer>(t: &Time, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_time_of_day(*t))
}

fn serialize_days<S: serde::Serializer>(days: &[Weekday], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(days.iter().map(|d| weekday_tag(*d)))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, time};

    fn monday_zone() -> ZoneConfig {
        ZoneConfig {
            name: "lawn".into(),
            actuator: "17".into(),
            schedule: time!(5:00),
            days: vec![Weekday::Monday],
            duration_min: 10,
            enabled: true,
            zone_type: "lawn".into(),
            moisture_sensor: None,
            flow_sensor: None,
            moisture_threshold: None,
        }
    }

    // -- parse_weekday -------------------------------------------------------

    #[test]
    fn weekday_short_and_long_forms() {
        assert_eq!(parse_weekday("mon"), Some(Weekday::Monday));
        assert_eq!(parse_weekday("Monday"), Some(Weekday::Monday));
        assert_eq!(parse_weekday("  THURSDAY "), Some(Weekday::Thursday));
        assert_eq!(parse_weekday("sun"), Some(Weekday::Sunday));
    }

    #[test]
    fn weekday_rejects_garbage() {
        assert_eq!(parse_weekday("mo"), None);
        assert_eq!(parse_weekday("xyz"), None);
        assert_eq!(parse_weekday(""), None);
    }

    // -- parse_time_of_day ---------------------------------------------------

    #[test]
    fn time_of_day_valid() {
        assert_eq!(parse_time_of_day("05:00"), Some(time!(5:00)));
        assert_eq!(parse_time_of_day("23:59"), Some(time!(23:59)));
        assert_eq!(parse_time_of_day("7:5"), Some(time!(7:05)));
    }

    #[test]
    fn time_of_day_invalid() {
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("12:60"), None);
        assert_eq!(parse_time_of_day("noon"), None);
        assert_eq!(parse_time_of_day("1200"), None);
    }

    // -- schedule matching ---------------------------------------------------

    #[test]
    fn due_within_tolerance() {
        // 2024-01-01 is a Monday.
        let now = datetime!(2024-01-01 5:00:30 UTC);
        assert!(monday_zone().is_due(now, Duration::seconds(60)));
    }

    #[test]
    fn not_due_outside_tolerance() {
        let now = datetime!(2024-01-01 5:02:00 UTC);
        assert!(!monday_zone().is_due(now, Duration::seconds(60)));
    }

    #[test]
    fn due_shortly_before_schedule() {
        let now = datetime!(2024-01-01 4:59:15 UTC);
        assert!(monday_zone().is_due(now, Duration::seconds(60)));
    }

    #[test]
    fn not_due_on_other_weekday() {
        let tuesday = datetime!(2024-01-02 5:00:00 UTC);
        assert!(!monday_zone().is_due(tuesday, Duration::seconds(60)));
    }

    #[test]
    fn disabled_zone_never_due() {
        let mut zone = monday_zone();
        zone.enabled = false;
        let now = datetime!(2024-01-01 5:00:00 UTC);
        assert!(!zone.is_due(now, Duration::seconds(60)));
        assert!(zone.next_scheduled_at(now).is_none());
    }

    #[test]
    fn next_scheduled_today_only() {
        let zone = monday_zone();
        let monday = datetime!(2024-01-01 12:00:00 UTC);
        assert_eq!(
            zone.next_scheduled_at(monday),
            Some(datetime!(2024-01-01 5:00:00 UTC))
        );
        let tuesday = datetime!(2024-01-02 12:00:00 UTC);
        assert!(zone.next_scheduled_at(tuesday).is_none());
    }

    #[test]
    fn serializes_schedule_and_days_as_tags() {
        let json = serde_json::to_value(monday_zone()).unwrap();
        assert_eq!(json["schedule"], "05:00");
        assert_eq!(json["days"], serde_json::json!(["mon"]));
    }
}
