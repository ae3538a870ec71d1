use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use regex::{Captures, Regex};
use serde::Serialize;

const FALLBACK_TITLE_CHARS: usize = 50;
const DEFAULT_EVENT_MINUTES: i64 = 60;
const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december\
                      |jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";

/// Calendar event pulled out of a screenshot summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventBlock {
    pub title: String,
    pub details: String,
    pub start: DateTime<Utc>,
    /// One hour after `start` unless the text names an end time.
    pub end: DateTime<Utc>,
    /// Whether the model emitted the tagged lines, as opposed to fallbacks.
    pub tagged: bool,
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new(&$pattern).expect("static regex"))
        }
    };
}

static_regex!(title_re, r"(?im)^\s*\**Event Title:\**\s*(.+)$");
static_regex!(details_re, r"(?im)^\s*\**Event Details:\**\s*(.+)$");
static_regex!(iso_date_re, r"\b(\d{4})-(\d{2})-(\d{2})\b");
static_regex!(month_day_re, format!(r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s+(\d{{4}})\b)?"));
static_regex!(day_month_re, format!(r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\b(?:,?\s+(\d{{4}})\b)?"));
static_regex!(numeric_date_re, r"\b(\d{1,2})/(\d{1,2})(?:/(\d{4}|\d{2}))?\b");
static_regex!(relative_day_re, r"(?i)\b(today|tonight|tomorrow)\b");
static_regex!(weekday_re, r"(?i)\b(?:(next)\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b");
static_regex!(
    time_range_re,
    r"(?i)\b(\d{1,2})(?::([0-5]\d))?\s*(am|pm)?\s*(?:-|\x{2013}|to|until)\s*(\d{1,2})(?::([0-5]\d))?\s*(am|pm)\b"
);
static_regex!(clock_12h_re, r"(?i)\b(\d{1,2})(?::([0-5]\d))?\s*(?:(am|pm)\b|([ap])\.m\.)");
static_regex!(clock_24h_re, r"\b([01]?\d|2[0-3]):([0-5]\d)\b");

/// Extracts a calendar event from `summary`, relative to the current time.
/// Returns `None` when the text names no date or time.
pub fn parse_event_block(summary: &str) -> Option<EventBlock> {
    parse_event_block_at(summary, Utc::now())
}

/// Like [`parse_event_block`], with relative dates ("tomorrow", "Friday")
/// resolved against `now`. Missing tags fall back to the first sentence for
/// the title and the full text for the details.
pub fn parse_event_block_at(summary: &str, now: DateTime<Utc>) -> Option<EventBlock> {
    let text = summary.trim();
    if text.is_empty() {
        return None;
    }
    let (start, end) = detect_when(text, now)?;

    let title = title_re().captures(text).map(|c| c[1].trim().to_string());
    let details = details_re().captures(text).map(|c| c[1].trim().to_string());
    let tagged = title.is_some() || details.is_some();

    let title = title.unwrap_or_else(|| {
        let first = text.split('.').next().unwrap_or(text).trim();
        let mut t: String = first.chars().take(FALLBACK_TITLE_CHARS).collect();
        t.push_str("...");
        t
    });
    let details = details.unwrap_or_else(|| text.to_string());
    Some(EventBlock { title: title.trim_end_matches(['\r', '\n']).to_string(), details, start, end, tagged })
}

fn detect_when(text: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.date_naive();
    let day = find_date(text, today);
    let time = find_time(text);
    if day.is_none() && time.is_none() {
        return None;
    }
    // a date without a time lands at midday
    let (start_time, end_time) = time.unwrap_or((NaiveTime::from_hms_opt(12, 0, 0)?, None));
    let day = day.unwrap_or(today);
    let start = Utc.from_utc_datetime(&day.and_time(start_time));
    let end = match end_time {
        Some(t) => {
            let end = Utc.from_utc_datetime(&day.and_time(t));
            if end <= start { end + Duration::days(1) } else { end }
        }
        None => start + Duration::minutes(DEFAULT_EVENT_MINUTES),
    };
    Some((start, end))
}

fn collect_dates(
    hits: &mut Vec<(usize, NaiveDate)>,
    re: &Regex,
    text: &str,
    to_date: impl Fn(&Captures) -> Option<NaiveDate>,
) {
    hits.extend(re.captures_iter(text).filter_map(|c| Some((c.get(0)?.start(), to_date(&c)?))));
}

/// Earliest date mention in the text.
fn find_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let mut hits = Vec::new();
    collect_dates(&mut hits, iso_date_re(), text, |c| {
        NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    });
    collect_dates(&mut hits, month_day_re(), text, |c| {
        let year = year_or(c.get(3).map(|m| m.as_str()), today);
        NaiveDate::from_ymd_opt(year, month_number(&c[1])?, c[2].parse().ok()?)
    });
    collect_dates(&mut hits, day_month_re(), text, |c| {
        let year = year_or(c.get(3).map(|m| m.as_str()), today);
        NaiveDate::from_ymd_opt(year, month_number(&c[2])?, c[1].parse().ok()?)
    });
    collect_dates(&mut hits, numeric_date_re(), text, |c| {
        let year = year_or(c.get(3).map(|m| m.as_str()), today);
        NaiveDate::from_ymd_opt(year, c[1].parse().ok()?, c[2].parse().ok()?)
    });
    collect_dates(&mut hits, relative_day_re(), text, |c| match c[1].to_ascii_lowercase().as_str() {
        "tomorrow" => today.succ_opt(),
        _ => Some(today),
    });
    collect_dates(&mut hits, weekday_re(), text, |c| {
        let target: Weekday = c[2].parse().ok()?;
        let mut ahead = (7 + target.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
        if ahead == 0 && c.get(1).is_some() {
            ahead = 7;
        }
        today.checked_add_signed(Duration::days(i64::from(ahead)))
    });

    hits.into_iter().min_by_key(|(pos, _)| *pos).map(|(_, d)| d)
}

fn month_number(name: &str) -> Option<u32> {
    const ABBREV: [&str; 12] = ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
    let lower = name.to_ascii_lowercase();
    ABBREV.iter().position(|m| lower.starts_with(m)).map(|i| i as u32 + 1)
}

fn year_or(raw: Option<&str>, today: NaiveDate) -> i32 {
    match raw.and_then(|y| y.parse::<i32>().ok()) {
        Some(y) if y < 100 => 2000 + y,
        Some(y) => y,
        None => today.year(),
    }
}

/// Start time, plus an end time when the text gives a range.
fn find_time(text: &str) -> Option<(NaiveTime, Option<NaiveTime>)> {
    if let Some(c) = time_range_re().captures(text) {
        let end_meridiem = c.get(6).map(|m| m.as_str());
        let start_meridiem = c.get(3).map(|m| m.as_str()).or(end_meridiem);
        let start = clock(&c[1], c.get(2).map(|m| m.as_str()), start_meridiem);
        let end = clock(&c[4], c.get(5).map(|m| m.as_str()), end_meridiem);
        if let (Some(start), Some(end)) = (start, end) {
            return Some((start, Some(end)));
        }
    }

    let twelve = clock_12h_re().captures(text).and_then(|c| {
        let meridiem = c.get(3).or(c.get(4)).map(|m| m.as_str());
        Some((c.get(0)?.start(), clock(&c[1], c.get(2).map(|m| m.as_str()), meridiem)?))
    });
    let twenty_four = clock_24h_re().captures(text).and_then(|c| {
        Some((c.get(0)?.start(), NaiveTime::from_hms_opt(c[1].parse().ok()?, c[2].parse().ok()?, 0)?))
    });
    [twelve, twenty_four].into_iter().flatten().min_by_key(|(pos, _)| *pos).map(|(_, t)| (t, None))
}

fn clock(hour: &str, minute: Option<&str>, meridiem: Option<&str>) -> Option<NaiveTime> {
    let mut hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.map_or(Some(0), |m| m.parse().ok())?;
    if let Some(m) = meridiem {
        if !(1..=12).contains(&hour) {
            return None;
        }
        let pm = m.to_ascii_lowercase().starts_with('p');
        hour = match (pm, hour) {
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, 12) => 0,
            (false, h) => h,
        };
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wednesday
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn tagged_lines_are_extracted() {
        let summary = "A poster for a jazz night.\nEvent Title: Jazz Night\nEvent Details: Friday 8pm at Blue Room";
        let ev = parse_event_block_at(summary, now()).unwrap();
        assert_eq!(ev.title, "Jazz Night");
        assert_eq!(ev.details, "Friday 8pm at Blue Room");
        assert!(ev.tagged);
        assert_eq!(ev.start, at(2026, 10, 16, 20, 0));
        assert_eq!(ev.end, at(2026, 10, 16, 21, 0));
    }

    #[test]
    fn markdown_bold_tags_and_case_are_tolerated() {
        let ev = parse_event_block_at("**event title:** Standup\n**Event Details:** 9:30 daily", now()).unwrap();
        assert_eq!(ev.title, "Standup");
        assert_eq!(ev.details, "9:30 daily");
        assert_eq!(ev.start, at(2026, 10, 14, 9, 30));
    }

    #[test]
    fn untagged_summary_with_a_date_falls_back() {
        let summary = "A screenshot of a chat about lunch on March 3. Bring snacks.";
        let ev = parse_event_block_at(summary, now()).unwrap();
        assert_eq!(ev.title, "A screenshot of a chat about lunch on March 3...");
        assert_eq!(ev.details, summary);
        assert!(!ev.tagged);
        assert_eq!(ev.start, at(2026, 3, 3, 12, 0));
        assert_eq!(ev.end - ev.start, Duration::hours(1));
    }

    #[test]
    fn text_without_a_date_is_not_an_event() {
        assert!(parse_event_block_at("A photo of a cat sleeping on a sofa.", now()).is_none());
        assert!(parse_event_block_at("Event Title: Cat\nEvent Details: a cat on a sofa", now()).is_none());
        assert!(parse_event_block_at("   ", now()).is_none());
    }

    #[test]
    fn time_ranges_set_the_end() {
        let ev = parse_event_block_at("Dinner on Oct 21, 2026 from 7 to 9pm", now()).unwrap();
        assert_eq!(ev.start, at(2026, 10, 21, 19, 0));
        assert_eq!(ev.end, at(2026, 10, 21, 21, 0));

        let late = parse_event_block_at("Party tomorrow 11pm-1am", now()).unwrap();
        assert_eq!(late.start, at(2026, 10, 15, 23, 0));
        assert_eq!(late.end, at(2026, 10, 16, 1, 0));
    }

    #[test]
    fn numeric_and_iso_dates() {
        let ev = parse_event_block_at("Dentist 12/5 at 3:15 p.m.", now()).unwrap();
        assert_eq!(ev.start, at(2026, 12, 5, 15, 15));

        let ev = parse_event_block_at("Deploy window 2027-01-09 14:30 UTC", now()).unwrap();
        assert_eq!(ev.start, at(2027, 1, 9, 14, 30));

        let ev = parse_event_block_at("Sprint review next Wednesday", now()).unwrap();
        assert_eq!(ev.start, at(2026, 10, 21, 12, 0));
    }
}
