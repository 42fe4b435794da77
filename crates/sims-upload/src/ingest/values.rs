//! Cell text interpretation shared by inference, validation and overlap checks

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Spreadsheet exports write these where a cell is really empty
const BLANK_MARKERS: &[&str] = &["nan", "none", "nat", "<na>", "null"];

pub fn is_blank(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || BLANK_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m))
}

/// Trimmed text, or `None` for blank cells
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !is_blank(v))
}

/// Numeric text whose leading `+` or zeros carry meaning, e.g. "00123"
///
/// Such values are codes, not quantities; storing them as numbers would
/// drop the padding.
pub fn is_padded_number(value: &str) -> bool {
    let text = value.trim();
    if parse_decimal(text).is_none() {
        return false;
    }
    if text.starts_with('+') {
        return true;
    }

    let mut digits = text.strip_prefix('-').unwrap_or(text).chars();
    digits.next() == Some('0') && digits.next().is_some_and(|c| c.is_ascii_digit())
}

pub fn parse_integer(value: &str) -> Option<i64> {
    let text = value.trim();
    if text.contains(',') {
        return None;
    }
    text.parse::<i64>().ok()
}

/// Decimal text with thousands separators removed, e.g. "1,234.50" -> "1234.50"
pub fn parse_decimal(value: &str) -> Option<String> {
    let text = value.trim();
    let unsigned = text.strip_prefix('+').unwrap_or(text);
    let (sign, digits) = match unsigned.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", unsigned),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };

    if let Some(fraction) = fraction {
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    if whole.is_empty() && fraction.map_or(true, str::is_empty) {
        return None;
    }

    let whole = if whole.contains(',') {
        let mut groups = whole.split(',');
        let head = groups.next().unwrap_or_default();
        let head_ok = (1..=3).contains(&head.len()) && head.chars().all(|c| c.is_ascii_digit());
        let rest_ok = groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()));
        if !(head_ok && rest_ok) {
            return None;
        }
        whole.replace(',', "")
    } else if whole.chars().all(|c| c.is_ascii_digit()) {
        whole.to_string()
    } else {
        return None;
    };

    Some(match fraction {
        Some(fraction) => format!("{sign}{whole}.{fraction}"),
        None => format!("{sign}{whole}"),
    })
}

pub fn parse_number(value: &str) -> Option<f64> {
    parse_decimal(value).and_then(|text| text.parse().ok())
}

/// Dates in the layouts spreadsheet users actually type
///
/// Accepts `-`, `/` and `.` delimiters, `2024年1月5日`, compact `20240105`,
/// day-first `05-01-2024`, and a trailing midnight time.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let mut text = value.trim().to_string();
    if text.is_empty() {
        return None;
    }

    text = text
        .replace('年', "-")
        .replace('月', "-")
        .replace('日', "")
        .replace(['/', '.'], "-");

    if let Some(date_part) = text.strip_suffix(" 00:00:00") {
        text = date_part.to_string();
    }

    ["%Y-%m-%d", "%Y%m%d", "%d-%m-%Y", "%m-%d-%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&text, format).ok())
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let text = value.trim();
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
    ];

    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| parse_date(text).map(|date| date.and_time(NaiveTime::MIN)))
}

/// Parse with an explicit strftime layout first, then fall back to ISO forms
///
/// Blank and `nan` cells give `None`.
pub fn parse_time_value(value: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    let text = non_blank(Some(value))?;

    if let Some(format) = format {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date.and_time(NaiveTime::MIN));
        }
    }

    parse_timestamp(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_markers() {
        assert!(is_blank(""));
        assert!(is_blank("   "));
        assert!(is_blank("NaN"));
        assert!(is_blank("<NA>"));
        assert!(!is_blank("0"));
        assert_eq!(non_blank(Some("  x ")), Some("x"));
        assert_eq!(non_blank(Some("nan")), None);
    }

    #[test]
    fn test_decimal_strips_grouping() {
        assert_eq!(parse_decimal("1,234.50").as_deref(), Some("1234.50"));
        assert_eq!(parse_decimal("+12").as_deref(), Some("12"));
        assert_eq!(parse_decimal("-0.5").as_deref(), Some("-0.5"));
        assert_eq!(parse_decimal("12,34"), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn test_integer_rejects_grouping() {
        assert_eq!(parse_integer(" 42 "), Some(42));
        assert_eq!(parse_integer("1,000"), None);
        assert_eq!(parse_integer("4.5"), None);
    }

    #[test]
    fn test_padded_numbers() {
        assert!(is_padded_number("00123"));
        assert!(is_padded_number(" 0456 "));
        assert!(is_padded_number("+81"));
        assert!(is_padded_number("-007"));
        assert!(is_padded_number("01.50"));
        assert!(!is_padded_number("0"));
        assert!(!is_padded_number("0.5"));
        assert!(!is_padded_number("123"));
        assert!(!is_padded_number("05-01-2024"));
    }

    #[test]
    fn test_date_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5);
        assert_eq!(parse_date("2024-01-05"), expected);
        assert_eq!(parse_date("2024/1/5"), expected);
        assert_eq!(parse_date("2024.01.05"), expected);
        assert_eq!(parse_date("2024年1月5日"), expected);
        assert_eq!(parse_date("20240105"), expected);
        assert_eq!(parse_date("2024-01-05 00:00:00"), expected);
        assert_eq!(parse_date("25-12-2024"), NaiveDate::from_ymd_opt(2024, 12, 25));
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn test_time_value_prefers_explicit_format() {
        let parsed = parse_time_value("01/02/2024", Some("%m/%d/%Y")).unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());

        // Values already canonicalised to ISO still parse
        let iso = parse_time_value("2024-01-02", Some("%m/%d/%Y")).unwrap();
        assert_eq!(iso, parsed);

        assert!(parse_time_value("nan", None).is_none());
        assert!(parse_time_value("2024-03-01 08:30", None).is_some());
    }
}
