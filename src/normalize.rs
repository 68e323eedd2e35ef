//! Turns the loose expressions a caller (or the language model) uses for dates, times, services
//! and names into the normalized values stored in session slots.

use crate::types::{Language, Service};

use regex::Regex;
use std::sync::OnceLock;
use time::macros::format_description;
use time::{Date, Duration, Time, Weekday};

const WEEKDAYS: &[(Weekday, &[&str])] = &[
    (Weekday::Monday, &["monday", "الاثنين", "الإثنين"]),
    (Weekday::Tuesday, &["tuesday", "الثلاثاء"]),
    (Weekday::Wednesday, &["wednesday", "الأربعاء", "الاربعاء"]),
    (Weekday::Thursday, &["thursday", "الخميس"]),
    (Weekday::Friday, &["friday", "الجمعة", "الجمعه"]),
    (Weekday::Saturday, &["saturday", "السبت"]),
    (Weekday::Sunday, &["sunday", "الأحد", "الاحد", "الحد"]),
];

const DAY_AFTER_TOMORROW: &[&str] = &["day after tomorrow", "بعد بكرا", "بعد بكرة", "بعد بكره", "بعد غد"];
const TOMORROW: &[&str] = &["tomorrow", "بكرا", "بكرة", "بكره", "غدا", "غداً"];
const TODAY: &[&str] = &["today", "tonight", "اليوم", "هلق", "هلأ"];

const PM_MARKERS: &[&str] = &[
    "pm", "p.m", "afternoon", "evening", "بعد الظهر", "بعد الضهر", "المسا", "مساء", "العصر",
];
const AM_MARKERS: &[&str] = &["am", "a.m", "morning", "صباحا", "صباحاً", "الصبح", "الصباح"];
const NOON: &[&str] = &["noon", "midday", "الظهر", "الضهر"];

/// Which language the text is written in, judged by script. `None` when the text has no letters.
pub fn detect_language(text: &str) -> Option<Language> {
    let arabic = text
        .chars()
        .filter(|c| ('\u{0600}'..='\u{06FF}').contains(c))
        .count();
    let latin = text.chars().filter(|c| c.is_ascii_alphabetic()).count();
    match (arabic, latin) {
        (0, 0) => None,
        (a, l) if a > l => Some(Language::Arabic),
        _ => Some(Language::English),
    }
}

/// Maps Arabic-Indic and Eastern Arabic-Indic digits onto ASCII.
pub fn ascii_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            _ => c,
        })
        .collect()
}

/// Resolves a date expression against `today` (the call's start date in shop time).
///
/// ISO dates in the past roll forward to their next occurrence. Relative words and weekday
/// names are resolved forward; naming today's weekday means next week.
pub fn parse_date(expr: &str, today: Date) -> Option<Date> {
    let text = ascii_digits(expr.trim()).to_lowercase();
    if text.is_empty() {
        return None;
    }
    if let Ok(date) = Date::parse(&text, format_description!("[year]-[month]-[day]")) {
        return Some(roll_forward(date, today));
    }
    relative_date(&text, today)
}

/// Looks for a relative date anywhere in a full utterance. Used when the model missed one.
pub fn date_from_utterance(utterance: &str, today: Date) -> Option<Date> {
    relative_date(&utterance.to_lowercase(), today)
}

fn relative_date(text: &str, today: Date) -> Option<Date> {
    if DAY_AFTER_TOMORROW.iter().any(|w| text.contains(w)) {
        return today.checked_add(Duration::days(2));
    }
    if TOMORROW.iter().any(|w| text.contains(w)) {
        return today.checked_add(Duration::days(1));
    }
    if TODAY.iter().any(|w| text.contains(w)) {
        return Some(today);
    }
    let mut named = WEEKDAYS
        .iter()
        .filter(|(_, names)| names.iter().any(|n| text.contains(n)))
        .map(|(weekday, _)| *weekday);
    let weekday = named.next()?;
    if named.next().is_some() {
        // "monday or tuesday" is not a date
        return None;
    }
    let current = i64::from(today.weekday().number_days_from_monday());
    let target = i64::from(weekday.number_days_from_monday());
    let ahead = match (target - current).rem_euclid(7) {
        0 => 7,
        n => n,
    };
    today.checked_add(Duration::days(ahead))
}

fn roll_forward(date: Date, today: Date) -> Date {
    if date >= today {
        return date;
    }
    match date.replace_year(today.year()) {
        Ok(this_year) if this_year >= today => this_year,
        _ => date.replace_year(today.year() + 1).unwrap_or(date),
    }
}

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{1,2})(?:[:.](\d{2}))?").expect("time pattern compiles")
    })
}

/// Resolves a clock-time expression to a 24h time.
///
/// Without a meridiem a bare hour is read into opening hours: 1 to 8 is the afternoon and
/// 9 to 12 the morning. Expressions without a clock hour ("afternoon", "later") are ambiguous.
pub fn parse_time(expr: &str) -> Option<Time> {
    let text = ascii_digits(expr.trim()).to_lowercase();
    let pm = has_marker(&text, PM_MARKERS);
    let am = !pm && has_marker(&text, AM_MARKERS);

    let Some(caps) = time_pattern().captures(&text) else {
        if !pm && has_marker(&text, NOON) {
            return Time::from_hms(12, 0, 0).ok();
        }
        return None;
    };
    let raw_hour = caps.get(1)?.as_str();
    let hour: u8 = raw_hour.parse().ok()?;
    let minute: u8 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };

    let hour = if pm {
        match hour {
            1..=11 => hour + 12,
            12 => 12,
            _ => return None,
        }
    } else if am {
        match hour {
            12 => 0,
            0..=11 => hour,
            _ => return None,
        }
    } else if raw_hour.starts_with('0') || hour >= 13 {
        hour
    } else {
        match hour {
            1..=8 => hour + 12,
            9..=12 => hour,
            _ => return None,
        }
    };
    Time::from_hms(hour, minute, 0).ok()
}

/// Latin markers must stand alone ("sam" holds no a.m.); Arabic ones attach to prefixes.
fn has_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| {
        if !m.is_ascii() {
            return text.contains(m);
        }
        text.match_indices(m).any(|(i, _)| {
            let before = text[..i].chars().next_back();
            let after = text[i + m.len()..].chars().next();
            !before.is_some_and(char::is_alphabetic) && !after.is_some_and(char::is_alphabetic)
        })
    })
}

/// Picks the catalogue service a phrase refers to. Naming two different services is ambiguous
/// unless the caller asked for the full service.
pub fn parse_service(expr: &str) -> Option<Service> {
    let text = expr.trim().to_lowercase();
    if ["full", "everything", "كامل", "الكل", "كل شي"]
        .iter()
        .any(|w| text.contains(w))
    {
        return Some(Service::FullService);
    }
    let mut found = Vec::new();
    if ["beard", "دقن", "ذقن", "لحية", "لحيه"].iter().any(|w| text.contains(w)) {
        found.push(Service::BeardTrim);
    }
    if ["wash", "shampoo", "غسل", "غسيل", "شامبو"].iter().any(|w| text.contains(w)) {
        found.push(Service::HairWash);
    }
    let beard_only = found == [Service::BeardTrim] && !text.contains("hair");
    if !beard_only
        && ["haircut", "hair cut", "cut", "trim", "حلاقة", "حلاقه", "قص", "قصة"]
            .iter()
            .any(|w| text.contains(w))
    {
        found.push(Service::Haircut);
    }
    found.dedup();
    match found.as_slice() {
        [single] => Some(*single),
        _ => None,
    }
}

/// Cleans a customer name: at most four words, letters only, Latin words capitalized.
pub fn clean_name(expr: &str) -> Option<String> {
    let trimmed = expr
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.is_empty() || words.len() > 4 {
        return None;
    }
    let valid = words
        .iter()
        .all(|w| w.chars().all(|c| c.is_alphabetic() || c == '-' || c == '\''));
    if !valid {
        return None;
    }
    let name = words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Some(name)
}

fn name_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bmy\s+name\s+is\s+([\p{L}'-]+)",
            r"(?i)\bcall\s+me\s+([\p{L}'-]+)",
            r"اسمي\s+([\p{L}]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("name pattern compiles"))
        .collect()
    })
}

/// Recovers a first name from common self-introductions when the model missed it.
pub fn name_from_utterance(utterance: &str) -> Option<String> {
    name_patterns()
        .iter()
        .find_map(|p| p.captures(utterance))
        .and_then(|caps| caps.get(1))
        .and_then(|m| clean_name(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, time};

    // A Wednesday.
    const TODAY: Date = date!(2030 - 01 - 09);

    #[test]
    fn relative_dates_resolve_forward() {
        assert_eq!(parse_date("today", TODAY), Some(TODAY));
        assert_eq!(parse_date("Tomorrow", TODAY), Some(date!(2030 - 01 - 10)));
        assert_eq!(
            parse_date("the day after tomorrow", TODAY),
            Some(date!(2030 - 01 - 11))
        );
        assert_eq!(parse_date("بكرا", TODAY), Some(date!(2030 - 01 - 10)));
        assert_eq!(parse_date("بعد بكرا", TODAY), Some(date!(2030 - 01 - 11)));
    }

    #[test]
    fn weekdays_pick_next_occurrence() {
        assert_eq!(parse_date("monday", TODAY), Some(date!(2030 - 01 - 14)));
        assert_eq!(parse_date("next friday", TODAY), Some(date!(2030 - 01 - 11)));
        // same weekday as today means a week out
        assert_eq!(parse_date("wednesday", TODAY), Some(date!(2030 - 01 - 16)));
        assert_eq!(parse_date("يوم السبت", TODAY), Some(date!(2030 - 01 - 12)));
        assert_eq!(parse_date("monday or tuesday", TODAY), None);
    }

    #[test]
    fn iso_dates_in_the_past_roll_forward() {
        assert_eq!(parse_date("2030-03-02", TODAY), Some(date!(2030 - 03 - 02)));
        assert_eq!(parse_date("2029-01-20", TODAY), Some(date!(2030 - 01 - 20)));
        assert_eq!(parse_date("2029-01-02", TODAY), Some(date!(2031 - 01 - 02)));
    }

    #[test]
    fn vague_dates_are_ambiguous() {
        assert_eq!(parse_date("sometime soon", TODAY), None);
        assert_eq!(parse_date("", TODAY), None);
    }

    #[test]
    fn times_normalize_to_24h() {
        assert_eq!(parse_time("2pm"), Some(time!(14:00)));
        assert_eq!(parse_time("2:30 PM"), Some(time!(14:30)));
        assert_eq!(parse_time("14:15"), Some(time!(14:15)));
        assert_eq!(parse_time("09:45"), Some(time!(09:45)));
        assert_eq!(parse_time("10 am"), Some(time!(10:00)));
        assert_eq!(parse_time("12 am"), Some(time!(00:00)));
        assert_eq!(parse_time("noon"), Some(time!(12:00)));
        assert_eq!(parse_time("3 with sam"), Some(time!(15:00)));
        assert_eq!(parse_time("الساعة ٣ بعد الظهر"), Some(time!(15:00)));
    }

    #[test]
    fn bare_hours_read_into_opening_hours() {
        assert_eq!(parse_time("at 3"), Some(time!(15:00)));
        assert_eq!(parse_time("10"), Some(time!(10:00)));
        assert_eq!(parse_time("12"), Some(time!(12:00)));
    }

    #[test]
    fn vague_times_are_ambiguous() {
        assert_eq!(parse_time("in the afternoon"), None);
        assert_eq!(parse_time("later"), None);
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("13 pm"), None);
    }

    #[test]
    fn services_match_in_both_languages() {
        assert_eq!(parse_service("a haircut please"), Some(Service::Haircut));
        assert_eq!(parse_service("Beard trim"), Some(Service::BeardTrim));
        assert_eq!(parse_service("hair wash"), Some(Service::HairWash));
        assert_eq!(parse_service("the full service"), Some(Service::FullService));
        assert_eq!(parse_service("بدي حلاقة"), Some(Service::Haircut));
        assert_eq!(parse_service("تشذيب دقن"), Some(Service::BeardTrim));
        assert_eq!(parse_service("haircut and a beard trim"), None);
        assert_eq!(parse_service("massage"), None);
    }

    #[test]
    fn names_are_cleaned() {
        assert_eq!(clean_name(" john "), Some("John".to_string()));
        assert_eq!(clean_name("mary-jane o'neil."), Some("Mary-jane O'neil".to_string()));
        assert_eq!(clean_name("محمد"), Some("محمد".to_string()));
        assert_eq!(clean_name("r2d2"), None);
        assert_eq!(clean_name("a b c d e"), None);
    }

    #[test]
    fn names_recovered_from_introductions() {
        assert_eq!(
            name_from_utterance("Hi, my name is kevin and I need a cut"),
            Some("Kevin".to_string())
        );
        assert_eq!(name_from_utterance("مرحبا اسمي أحمد"), Some("أحمد".to_string()));
        assert_eq!(name_from_utterance("I need a haircut"), None);
        assert_eq!(name_from_utterance("yes this is perfect"), None);
    }

    #[test]
    fn language_follows_script() {
        assert_eq!(detect_language("I want a haircut"), Some(Language::English));
        assert_eq!(detect_language("بدي موعد بكرا"), Some(Language::Arabic));
        assert_eq!(detect_language("بدي موعد haircut بكرا"), Some(Language::Arabic));
        assert_eq!(detect_language("123"), None);
    }

    #[test]
    fn arabic_digits_become_ascii() {
        assert_eq!(ascii_digits("٣:٣٠"), "3:30");
        assert_eq!(ascii_digits("۴"), "4");
    }
}
