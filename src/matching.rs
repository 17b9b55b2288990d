//! Attribute matching between a query mask and candidate records.
//!
//! The per-field rule is selected by the mask value and the field's VR:
//! empty value is a universal match, temporal VRs support range and
//! canonical-instant matching, multi-valued UID masks match as lists,
//! glob characters on textual VRs match as wildcards (case-insensitive for
//! person names), and everything else is single-value matching. Sequence
//! fields recurse with a one-item template.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dicom_core::{Tag, VR};
use tracing::debug;

use crate::record::{Element, Record, Value};

/// Match `candidate` against `mask`.
///
/// Returns the filtered response record when every mask field matched, and
/// `None` as soon as one field fails; the caller moves on to the next
/// candidate.
pub fn match_record(mask: &Record, candidate: &Record) -> Option<Record> {
    let mut result = Record::new();
    for (tag, mask_element) in mask.iter() {
        match match_field(*tag, mask_element, candidate) {
            Some(element) => result.put(*tag, element),
            None => {
                debug!(tag = %format_tag(*tag), "candidate fails the mask");
                return None;
            }
        }
    }
    Some(result)
}

fn match_field(tag: Tag, mask_element: &Element, candidate: &Record) -> Option<Element> {
    // Universal match: the requested key comes back with whatever the
    // candidate holds, or stays empty when the candidate has nothing.
    if mask_element.is_empty_value() {
        return Some(
            candidate
                .get(tag)
                .cloned()
                .unwrap_or_else(|| mask_element.clone()),
        );
    }

    if mask_element.vr == VR::SQ {
        return match_sequence(tag, mask_element, candidate);
    }

    let candidate_element = candidate.get(tag)?;
    let mask_values = mask_element.strings()?;
    let candidate_values = candidate_element.strings()?;
    let pattern = mask_values.first().map(String::as_str).unwrap_or_default();

    let matched = if is_temporal(mask_element.vr) {
        match_temporal(mask_element.vr, pattern, candidate_values)
    } else if mask_element.vr == VR::UI && mask_values.len() > 1 {
        // List of unique identifiers
        candidate_values.iter().any(|v| mask_values.contains(v))
    } else if is_textual(mask_element.vr) && (pattern.contains('*') || pattern.contains('?')) {
        let fold_case = mask_element.vr == VR::PN;
        candidate_values
            .iter()
            .any(|v| glob_match(pattern, v, fold_case))
    } else {
        let fold_case = mask_element.vr == VR::PN;
        candidate_values.iter().any(|v| {
            if fold_case {
                v.eq_ignore_ascii_case(pattern)
            } else {
                v == pattern
            }
        })
    };

    matched.then(|| candidate_element.clone())
}

fn match_sequence(tag: Tag, mask_element: &Element, candidate: &Record) -> Option<Element> {
    let templates = mask_element.items()?;
    if templates.len() != 1 {
        debug!(
            tag = %format_tag(tag),
            items = templates.len(),
            "sequence mask must hold exactly one template item"
        );
        return None;
    }
    let template = &templates[0];
    let candidate_items = candidate.items(tag)?;

    let matched: Vec<Record> = candidate_items
        .iter()
        .filter_map(|item| match_record(template, item))
        .collect();

    // A present-but-empty matched group is a non-match for the field
    if matched.is_empty() {
        return None;
    }
    Some(Element {
        vr: VR::SQ,
        value: Value::Items(matched),
    })
}

fn is_temporal(vr: VR) -> bool {
    matches!(vr, VR::DA | VR::TM | VR::DT)
}

fn is_textual(vr: VR) -> bool {
    matches!(
        vr,
        VR::AE
            | VR::AS
            | VR::CS
            | VR::LO
            | VR::LT
            | VR::PN
            | VR::SH
            | VR::ST
            | VR::UC
            | VR::UR
            | VR::UT
    )
}

fn format_tag(tag: Tag) -> String {
    format!("({:04X},{:04X})", tag.group(), tag.element())
}

// --- Temporal matching ---------------------------------------------------

/// Inclusive lower/upper instants a (possibly partial) temporal value covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Bounds {
    lower: NaiveDateTime,
    upper: NaiveDateTime,
}

fn match_temporal(vr: VR, pattern: &str, candidate_values: &[String]) -> bool {
    // A pattern that parses as a whole is an exact match after
    // normalization; this keeps ISO dates with their embedded dashes out of
    // the range rule.
    if let Some(bounds) = parse_bounds(vr, pattern) {
        return candidate_values
            .iter()
            .filter_map(|v| parse_bounds(vr, v))
            .any(|c| c.lower >= bounds.lower && c.lower <= bounds.upper);
    }

    if let Some((from, to)) = split_range(vr, pattern) {
        let lower = from.map(|b| b.lower);
        let upper = to.map(|b| b.upper);
        return candidate_values
            .iter()
            .filter_map(|v| parse_bounds(vr, v))
            .any(|c| {
                lower.map_or(true, |l| c.lower >= l) && upper.map_or(true, |u| c.lower <= u)
            });
    }

    // Unparseable temporal mask degrades to literal comparison
    candidate_values.iter().any(|v| v == pattern)
}

/// Split a range expression on the separator that leaves two parseable (or
/// empty) endpoints. Either endpoint may be empty, meaning unbounded.
fn split_range(vr: VR, pattern: &str) -> Option<(Option<Bounds>, Option<Bounds>)> {
    for (i, ch) in pattern.char_indices() {
        if ch != '-' {
            continue;
        }
        let (from, to) = (&pattern[..i], &pattern[i + 1..]);
        if from.is_empty() && to.is_empty() {
            continue;
        }
        let from_bounds = if from.is_empty() {
            None
        } else {
            match parse_bounds(vr, from) {
                Some(b) => Some(b),
                None => continue,
            }
        };
        let to_bounds = if to.is_empty() {
            None
        } else {
            match parse_bounds(vr, to) {
                Some(b) => Some(b),
                None => continue,
            }
        };
        return Some((from_bounds, to_bounds));
    }
    None
}

fn parse_bounds(vr: VR, value: &str) -> Option<Bounds> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match vr {
        VR::DA => parse_date_bounds(value).map(|(lower, upper)| Bounds {
            lower: lower.and_time(NaiveTime::MIN),
            upper: upper.and_time(max_time()),
        }),
        VR::TM => parse_time_bounds(value).map(|(lower, upper)| {
            let day = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
            Bounds {
                lower: day.and_time(lower),
                upper: day.and_time(upper),
            }
        }),
        VR::DT => parse_datetime_bounds(value),
        _ => None,
    }
}

fn max_time() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

/// Dates in compact (`YYYYMMDD`), ISO (`YYYY-MM-DD`) or prefix (`YYYY`,
/// `YYYYMM`) form; prefixes widen to the covered interval
fn parse_date_bounds(value: &str) -> Option<(NaiveDate, NaiveDate)> {
    if value.len() == 10 && value.as_bytes()[4] == b'-' && value.as_bytes()[7] == b'-' {
        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
        return Some((date, date));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match value.len() {
        8 => {
            let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
            Some((date, date))
        }
        6 => {
            let year: i32 = value[..4].parse().ok()?;
            let month: u32 = value[4..].parse().ok()?;
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)?
            };
            Some((first, next.pred_opt()?))
        }
        4 => {
            let year: i32 = value.parse().ok()?;
            Some((
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year, 12, 31)?,
            ))
        }
        _ => None,
    }
}

/// Times in compact form with optional fraction (`HH`, `HHMM`, `HHMMSS`,
/// `HHMMSS.FFFFFF`) or colon form (`HH:MM:SS`)
fn parse_time_bounds(value: &str) -> Option<(NaiveTime, NaiveTime)> {
    if value.len() == 8 && value.as_bytes()[2] == b':' && value.as_bytes()[5] == b':' {
        let time = NaiveTime::parse_from_str(value, "%H:%M:%S").ok()?;
        return Some((time, time));
    }

    let (digits, fraction) = match value.split_once('.') {
        Some((d, f)) => (d, Some(f)),
        None => (value, None),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hour: u32 = digits.get(0..2)?.parse().ok()?;
    match digits.len() {
        2 => Some((
            NaiveTime::from_hms_opt(hour, 0, 0)?,
            NaiveTime::from_hms_micro_opt(hour, 59, 59, 999_999)?,
        )),
        4 => {
            let minute: u32 = digits[2..4].parse().ok()?;
            Some((
                NaiveTime::from_hms_opt(hour, minute, 0)?,
                NaiveTime::from_hms_micro_opt(hour, minute, 59, 999_999)?,
            ))
        }
        6 => {
            let minute: u32 = digits[2..4].parse().ok()?;
            let second: u32 = digits[4..6].parse().ok()?;
            match fraction {
                None => Some((
                    NaiveTime::from_hms_opt(hour, minute, second)?,
                    NaiveTime::from_hms_micro_opt(hour, minute, second, 999_999)?,
                )),
                Some(fraction) => {
                    let padded = format!("{:0<6}", fraction);
                    let micros: u32 = padded.get(..6)?.parse().ok()?;
                    let time = NaiveTime::from_hms_micro_opt(hour, minute, second, micros)?;
                    Some((time, time))
                }
            }
        }
        _ => None,
    }
}

/// Datetimes as a date part optionally followed by a compact time part
fn parse_datetime_bounds(value: &str) -> Option<Bounds> {
    if value.bytes().all(|b| b.is_ascii_digit()) && value.len() > 8 {
        let (date_part, time_part) = value.split_at(8);
        let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
        let (lower_time, upper_time) = parse_time_bounds(time_part)?;
        return Some(Bounds {
            lower: date.and_time(lower_time),
            upper: date.and_time(upper_time),
        });
    }
    let (lower_date, upper_date) = parse_date_bounds(value)?;
    Some(Bounds {
        lower: lower_date.and_time(NaiveTime::MIN),
        upper: upper_date.and_time(max_time()),
    })
}

// --- Wildcard matching ---------------------------------------------------

/// Glob matching with `*` and `?`, linear two-pointer with backtracking
fn glob_match(pattern: &str, text: &str, fold_case: bool) -> bool {
    let normalize = |s: &str| -> Vec<char> {
        if fold_case {
            s.chars().flat_map(char::to_lowercase).collect()
        } else {
            s.chars().collect()
        }
    };
    let pattern = normalize(pattern);
    let text = normalize(text);

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    fn candidate() -> Record {
        let mut record = Record::new();
        record.put_str(tags::PATIENT_ID, VR::LO, "PAT001");
        record.put_str(tags::PATIENT_NAME, VR::PN, "Alpha^Anna");
        record.put_str(tags::STUDY_DATE, VR::DA, "2020-06-01");
        record.put_str(tags::MODALITY, VR::CS, "CT\\MR");
        record.put_str(tags::SOP_INSTANCE_UID, VR::UI, "UID2");
        record
    }

    #[test]
    fn test_universal_match_returns_fields_unchanged() {
        let mut mask = Record::new();
        mask.put_str(tags::PATIENT_ID, VR::LO, "");
        mask.put_str(tags::PATIENT_NAME, VR::PN, "");

        let result = match_record(&mask, &candidate()).unwrap();
        assert_eq!(result.first_str(tags::PATIENT_ID), Some("PAT001"));
        assert_eq!(result.first_str(tags::PATIENT_NAME), Some("Alpha^Anna"));
    }

    #[test]
    fn test_universal_match_echoes_missing_key() {
        let mut mask = Record::new();
        mask.put_str(tags::ACCESSION_NUMBER, VR::SH, "");
        let result = match_record(&mask, &candidate()).unwrap();
        assert!(result.get(tags::ACCESSION_NUMBER).unwrap().is_empty_value());
    }

    #[test]
    fn test_wildcard_match() {
        let mut mask = Record::new();
        mask.put_str(tags::PATIENT_NAME, VR::PN, "A*");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut mask = Record::new();
        mask.put_str(tags::PATIENT_NAME, VR::PN, "B*");
        assert!(match_record(&mask, &candidate()).is_none());
    }

    #[test]
    fn test_wildcard_case_rules() {
        // Person names fold case
        assert!(glob_match("alpha*", "ALPHA^ANNA", true));
        // Other textual VRs do not
        let mut mask = Record::new();
        mask.put_str(tags::MODALITY, VR::CS, "c?");
        assert!(match_record(&mask, &candidate()).is_none());
        let mut mask = Record::new();
        mask.put_str(tags::MODALITY, VR::CS, "C?");
        assert!(match_record(&mask, &candidate()).is_some());
    }

    #[test]
    fn test_single_value_match_over_multiple_values() {
        let mut mask = Record::new();
        mask.put_str(tags::MODALITY, VR::CS, "MR");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut mask = Record::new();
        mask.put_str(tags::MODALITY, VR::CS, "US");
        assert!(match_record(&mask, &candidate()).is_none());
    }

    #[test]
    fn test_uid_list_match() {
        let mut mask = Record::new();
        mask.put_str(tags::SOP_INSTANCE_UID, VR::UI, "UID1\\UID2");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut mask = Record::new();
        mask.put_str(tags::SOP_INSTANCE_UID, VR::UI, "UID1\\UID3");
        assert!(match_record(&mask, &candidate()).is_none());
    }

    #[test]
    fn test_date_range_match() {
        let mut mask = Record::new();
        mask.put_str(tags::STUDY_DATE, VR::DA, "2020-2021");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut other = candidate();
        other.put_str(tags::STUDY_DATE, VR::DA, "2022-06-01");
        assert!(match_record(&mask, &other).is_none());
    }

    #[test]
    fn test_open_ended_date_ranges() {
        let mut mask = Record::new();
        mask.put_str(tags::STUDY_DATE, VR::DA, "20200101-");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut mask = Record::new();
        mask.put_str(tags::STUDY_DATE, VR::DA, "-20191231");
        assert!(match_record(&mask, &candidate()).is_none());
    }

    #[test]
    fn test_exact_date_normalizes_forms() {
        let mut mask = Record::new();
        mask.put_str(tags::STUDY_DATE, VR::DA, "20200601");
        assert!(match_record(&mask, &candidate()).is_some());

        let mut compact = candidate();
        compact.put_str(tags::STUDY_DATE, VR::DA, "20200601");
        let mut mask = Record::new();
        mask.put_str(tags::STUDY_DATE, VR::DA, "2020-06-01");
        assert!(match_record(&mask, &compact).is_some());
    }

    #[test]
    fn test_time_range_match() {
        let mut record = Record::new();
        record.put_str(tags::STUDY_TIME, VR::TM, "101530");

        let mut mask = Record::new();
        mask.put_str(tags::STUDY_TIME, VR::TM, "1000-1100");
        assert!(match_record(&mask, &record).is_some());

        let mut mask = Record::new();
        mask.put_str(tags::STUDY_TIME, VR::TM, "1100-");
        assert!(match_record(&mask, &record).is_none());
    }

    #[test]
    fn test_missing_field_fails_non_empty_mask() {
        let mut mask = Record::new();
        mask.put_str(tags::ACCESSION_NUMBER, VR::SH, "ACC1");
        assert!(match_record(&mask, &candidate()).is_none());
    }

    #[test]
    fn test_sequence_template_filters_items() {
        let mut item_ct = Record::new();
        item_ct.put_str(tags::CODE_VALUE, VR::SH, "CT");
        let mut item_mr = Record::new();
        item_mr.put_str(tags::CODE_VALUE, VR::SH, "MR");

        let mut record = candidate();
        record.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![item_ct, item_mr]);

        let mut template = Record::new();
        template.put_str(tags::CODE_VALUE, VR::SH, "MR");
        let mut mask = Record::new();
        mask.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![template]);

        let result = match_record(&mask, &record).unwrap();
        let items = result.items(tags::PROCEDURE_CODE_SEQUENCE).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].first_str(tags::CODE_VALUE), Some("MR"));
    }

    #[test]
    fn test_sequence_with_no_matching_items_fails() {
        let mut item = Record::new();
        item.put_str(tags::CODE_VALUE, VR::SH, "CT");
        let mut record = candidate();
        record.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![item]);

        let mut template = Record::new();
        template.put_str(tags::CODE_VALUE, VR::SH, "US");
        let mut mask = Record::new();
        mask.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![template]);

        assert!(match_record(&mask, &record).is_none());
    }

    #[test]
    fn test_glob_matcher() {
        assert!(glob_match("*", "anything", false));
        assert!(glob_match("a?c", "abc", false));
        assert!(!glob_match("a?c", "abbc", false));
        assert!(glob_match("a*c", "abbc", false));
        assert!(glob_match("*final", "semifinal", false));
        assert!(!glob_match("a*c", "abd", false));
        assert!(glob_match("", "", false));
        assert!(!glob_match("", "x", false));
    }
}
