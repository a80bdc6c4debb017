use chrono::NaiveDate;

/// Resolve a store-page release date string to a calendar date.
///
/// Accepted shapes, all case-insensitive on the month:
/// - `"12 Mar, 2021"` / `"Mar 12, 2021"`: that day
/// - `"Mar 2021"` / `"March 2021"`: first day of the month
/// - `"Q3 2021"`: first day of the quarter
/// - `"2021"`: January 1st
///
/// Anything else ("Coming soon", "To be announced", ...) yields `None`.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in ["%d %b, %Y", "%b %d, %Y", "%d %B, %Y", "%B %d, %Y", "%d %b %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    let parts: Vec<&str> = s.split_whitespace().collect();
    match parts.as_slice() {
        [month, year] => {
            let year: i32 = year.parse().ok()?;
            if let Some(quarter) = quarter_start_month(month) {
                return NaiveDate::from_ymd_opt(year, quarter, 1);
            }
            let month = month_number(month)?;
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        [year] if year.len() == 4 => NaiveDate::from_ymd_opt(year.parse().ok()?, 1, 1),
        _ => None,
    }
}

fn quarter_start_month(token: &str) -> Option<u32> {
    match token.to_ascii_uppercase().as_str() {
        "Q1" => Some(1),
        "Q2" => Some(4),
        "Q3" => Some(7),
        "Q4" => Some(10),
        _ => None,
    }
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = token.trim_end_matches('.').to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    let prefix = lower.get(..3)?;
    let idx = MONTHS.iter().position(|m| *m == prefix)?;
    // Reject things like "marble 2021"; accept "sept".
    let full = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ][idx];
    if full.starts_with(lower.as_str()) {
        Some(idx as u32 + 1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, day)
    }

    #[test]
    fn parses_full_dates_in_both_orders() {
        assert_eq!(parse_release_date("12 Mar, 2021"), d(2021, 3, 12));
        assert_eq!(parse_release_date("Mar 12, 2021"), d(2021, 3, 12));
        assert_eq!(parse_release_date(" 1 Sep, 2009 "), d(2009, 9, 1));
    }

    #[test]
    fn month_only_resolves_to_first_day() {
        assert_eq!(parse_release_date("Mar 2021"), d(2021, 3, 1));
        assert_eq!(parse_release_date("September 2024"), d(2024, 9, 1));
        assert_eq!(parse_release_date("Sept 2024"), d(2024, 9, 1));
    }

    #[test]
    fn quarter_resolves_to_quarter_start() {
        assert_eq!(parse_release_date("Q1 2025"), d(2025, 1, 1));
        assert_eq!(parse_release_date("Q3 2021"), d(2021, 7, 1));
        assert_eq!(parse_release_date("q4 2020"), d(2020, 10, 1));
    }

    #[test]
    fn bare_year_resolves_to_january_first() {
        assert_eq!(parse_release_date("2026"), d(2026, 1, 1));
    }

    #[test]
    fn unknown_shapes_are_none() {
        assert_eq!(parse_release_date(""), None);
        assert_eq!(parse_release_date("Coming soon"), None);
        assert_eq!(parse_release_date("To be announced"), None);
        assert_eq!(parse_release_date("Q5 2021"), None);
        assert_eq!(parse_release_date("Marble 2021"), None);
    }
}
