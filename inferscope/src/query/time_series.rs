//! Time-bucket SQL expressions.
//!
//! Pure helpers mapping a [`Frequency`] to the SQL fragment that assigns
//! each row to a bucket, and to the `WITH FILL STEP` literal used for gap
//! filling. No I/O; the unit enum is closed, so there is no runtime
//! unsupported-unit path.

use crate::types::{Frequency, FrequencyUnit};

use super::FROM_DATE_PARAM;

/// Alias every generated query selects its bucket under.
pub const TIME_BUCKET_ALIAS: &str = "time_bucket";

/// Native ClickHouse truncation function for a unit.
fn truncation_fn(unit: FrequencyUnit) -> &'static str {
    match unit {
        FrequencyUnit::Hour => "toStartOfHour",
        FrequencyUnit::Day => "toStartOfDay",
        FrequencyUnit::Week => "toStartOfWeek",
        FrequencyUnit::Month => "toStartOfMonth",
        FrequencyUnit::Quarter => "toStartOfQuarter",
        FrequencyUnit::Year => "toStartOfYear",
    }
}

/// SQL expression assigning `time_col` to its bucket.
///
/// Without a custom interval this is the unit's native truncation function.
/// With one, buckets are `interval * unit_seconds` wide and aligned so the
/// first bucket starts exactly at the request's `from_date` bind parameter:
///
/// ```text
/// from + floor((ts - from) / width) * width
/// ```
pub fn bucket_expression(frequency: &Frequency, time_col: &str) -> String {
    match frequency.interval {
        None => format!("{}({})", truncation_fn(frequency.unit), time_col),
        Some(_) => {
            let width = frequency.bucket_seconds();
            format!(
                "toDateTime(toUnixTimestamp({from}) + intDiv(toUnixTimestamp({col}) - toUnixTimestamp({from}), {width}) * {width})",
                from = FROM_DATE_PARAM,
                col = time_col,
                width = width,
            )
        }
    }
}

/// `WITH FILL STEP` literal for descending output. Native units use the
/// matching interval keyword; custom intervals step in seconds.
pub fn fill_step_literal(frequency: &Frequency) -> String {
    match frequency.interval {
        None => {
            let unit = match frequency.unit {
                FrequencyUnit::Hour => "HOUR",
                FrequencyUnit::Day => "DAY",
                FrequencyUnit::Week => "WEEK",
                FrequencyUnit::Month => "MONTH",
                FrequencyUnit::Quarter => "QUARTER",
                FrequencyUnit::Year => "YEAR",
            };
            format!("INTERVAL -1 {unit}")
        }
        Some(_) => format!("INTERVAL -{} SECOND", frequency.bucket_seconds()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_buckets_use_truncation_functions() {
        let cases = [
            (FrequencyUnit::Hour, "toStartOfHour(d.request_arrival_time)"),
            (FrequencyUnit::Day, "toStartOfDay(d.request_arrival_time)"),
            (FrequencyUnit::Week, "toStartOfWeek(d.request_arrival_time)"),
            (FrequencyUnit::Month, "toStartOfMonth(d.request_arrival_time)"),
            (FrequencyUnit::Quarter, "toStartOfQuarter(d.request_arrival_time)"),
            (FrequencyUnit::Year, "toStartOfYear(d.request_arrival_time)"),
        ];
        for (unit, expected) in cases {
            let frequency = Frequency::new(unit, None);
            assert_eq!(bucket_expression(&frequency, "d.request_arrival_time"), expected);
        }
    }

    #[test]
    fn custom_interval_aligns_to_from_date() {
        let frequency = Frequency::new(FrequencyUnit::Hour, Some(6));
        let expr = bucket_expression(&frequency, "d.request_arrival_time");
        // Aligned to the from_date parameter with a 6h width: the first
        // bucket equals from_date exactly.
        assert!(expr.contains(FROM_DATE_PARAM));
        assert!(expr.contains("intDiv("));
        assert!(expr.contains("21600"));
    }

    #[test]
    fn fill_step_is_negative_for_descending_order() {
        assert_eq!(
            fill_step_literal(&Frequency::new(FrequencyUnit::Hour, None)),
            "INTERVAL -1 HOUR"
        );
        assert_eq!(
            fill_step_literal(&Frequency::new(FrequencyUnit::Quarter, None)),
            "INTERVAL -1 QUARTER"
        );
        assert_eq!(
            fill_step_literal(&Frequency::new(FrequencyUnit::Day, Some(2))),
            "INTERVAL -172800 SECOND"
        );
    }
}
