//! SQL literal formatting for the target store's dialect.
//!
//! Every function here is pure. Callers splice the returned literals
//! straight into statements, so the output must stay bit-exact.

use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::{Decimal, RoundingStrategy};

pub const NULL: &str = "NULL";

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";
const CURRENCY_SCALE: u32 = 5;
const MONEY_SCALE: u32 = 2;

/// Booleans are stored as `-1` (true) and `0` (false).
pub fn format_bool(value: bool) -> String {
    if value { "-1" } else { "0" }.to_string()
}

pub fn format_int(value: Option<i64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => NULL.to_string(),
    }
}

/// `#yyyy-MM-dd HH:mm:ss#`, or `#yyyy-MM-dd#` when `with_time` is false.
pub fn format_date(value: Option<NaiveDateTime>, with_time: bool) -> String {
    let Some(value) = value else {
        return NULL.to_string();
    };
    let pattern = if with_time { DATE_TIME_FORMAT } else { DATE_FORMAT };
    format!("#{}#", value.format(pattern))
}

/// Fixed five-decimal representation, rounded half-up at the fifth place.
pub fn format_currency(value: Option<Decimal>) -> String {
    let Some(value) = value else {
        return NULL.to_string();
    };
    let rounded = value.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.5}", rounded)
}

/// Converts a raw floating amount into money, rounded half-up to cents.
///
/// The conversion goes through the shortest decimal representation of the
/// float, so `10.115` is treated as exactly 10.115 and becomes 10.12.
/// Returns `None` for NaN and infinities.
pub fn to_money(amount: f64) -> Option<Decimal> {
    if !amount.is_finite() {
        return None;
    }
    let exact = Decimal::from_str(&amount.to_string()).ok()?;
    Some(exact.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

/// Single-quoted string literal with embedded quotes doubled.
///
/// `max_len` bounds the escaped content in characters; the surrounding
/// quotes are not counted and the closing quote is always emitted. A cut
/// that would leave half of an escaped quote pair drops that half.
pub fn format_string(value: Option<&str>, max_len: Option<usize>) -> String {
    let Some(value) = value else {
        return NULL.to_string();
    };
    let mut escaped = value.replace('\'', "''");
    if let Some(max_len) = max_len {
        if escaped.chars().count() > max_len {
            escaped = escaped.chars().take(max_len).collect();
            let trailing_quotes = escaped.chars().rev().take_while(|c| *c == '\'').count();
            if trailing_quotes % 2 == 1 {
                escaped.pop();
            }
        }
    }
    format!("'{}'", escaped)
}

/// Wraps an identifier in brackets: `History` becomes `[History]`.
pub fn bracket(identifier: &str) -> String {
    format!("[{}]", identifier)
}

/// `INSERT INTO [table] ([c1],[c2]) VALUES (v1,v2)`.
///
/// Values are already-formatted literals and are joined verbatim.
pub fn build_insert<C, V>(table: &str, column_values: &[(C, V)]) -> String
where
    C: AsRef<str>,
    V: AsRef<str>,
{
    let columns = column_values
        .iter()
        .map(|(column, _)| bracket(column.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    let values = column_values
        .iter()
        .map(|(_, value)| value.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        bracket(table),
        columns,
        values
    )
}

/// Parses the text form the store keeps dates in, with or without time.
pub fn parse_stored_date(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_matches('#');
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, DATE_TIME_FORMAT) {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt);
    }
    chrono::NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(hh, mm, ss))
            .unwrap()
    }

    #[test]
    fn bools_use_access_convention() {
        assert_eq!(format_bool(true), "-1");
        assert_eq!(format_bool(false), "0");
    }

    #[test]
    fn ints_and_null() {
        let cases = [
            (None, "NULL"),
            (Some(0), "0"),
            (Some(10), "10"),
            (Some(100000), "100000"),
            (Some(-42), "-42"),
        ];
        for (input, expected) in cases {
            assert_eq!(format_int(input), expected);
        }
    }

    #[test]
    fn dates_with_and_without_time() {
        assert_eq!(format_date(None, true), "NULL");
        assert_eq!(format_date(None, false), "NULL");

        let date = at(2017, 9, 30, 13, 45, 24);
        assert_eq!(format_date(Some(date), true), "#2017-09-30 13:45:24#");
        assert_eq!(format_date(Some(date), false), "#2017-09-30#");

        let date = at(2007, 11, 6, 15, 27, 21);
        assert_eq!(format_date(Some(date), true), "#2007-11-06 15:27:21#");
        assert_eq!(format_date(Some(date), false), "#2007-11-06#");
    }

    #[test]
    fn currency_has_five_decimals() {
        let cases = [
            (None, "NULL"),
            (Some(dec!(0)), "0.00000"),
            (Some(dec!(100)), "100.00000"),
            (Some(dec!(200.0)), "200.00000"),
            (Some(dec!(300.10)), "300.10000"),
            (Some(dec!(400.100)), "400.10000"),
            (Some(dec!(500.101)), "500.10100"),
            (Some(dec!(1.000005)), "1.00001"),
        ];
        for (input, expected) in cases {
            assert_eq!(format_currency(input), expected);
        }
    }

    #[test]
    fn floats_become_money_rounded_half_up() {
        let cases = [
            (0.0, dec!(0)),
            (10.0, dec!(10)),
            (100000.0, dec!(100000)),
            (10.1, dec!(10.1)),
            (10.11, dec!(10.11)),
            (10.111, dec!(10.11)),
            (10.115, dec!(10.12)),
        ];
        for (input, expected) in cases {
            assert_eq!(to_money(input), Some(expected), "input {}", input);
        }
        assert_eq!(to_money(f64::NAN), None);
        assert_eq!(format_currency(to_money(10.115)), "10.12000");
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let cases = [
            (Some(""), "''"),
            (None, "NULL"),
            (Some("test"), "'test'"),
            (Some("'test'"), "'''test'''"),
            (Some("What''s up?"), "'What''''s up?'"),
        ];
        for (input, expected) in cases {
            assert_eq!(format_string(input, None), expected);
        }
    }

    #[test]
    fn strings_truncate_on_escaped_form() {
        let cases = [
            (Some(""), "''"),
            (None, "NULL"),
            (Some("test"), "'test'"),
            (Some("'test'"), "'''test'"),
            (Some("What''s up?"), "'What'''"),
        ];
        for (input, expected) in cases {
            assert_eq!(format_string(input, Some(6)), expected);
        }
    }

    #[test]
    fn truncation_never_splits_an_escaped_quote() {
        // "a'b" escapes to "a''b"; a cut after two characters would leave "a'".
        assert_eq!(format_string(Some("a'b"), Some(2)), "'a'");
        assert_eq!(format_string(Some("a'b"), Some(3)), "'a'''");
        assert_eq!(format_string(Some("éèà"), Some(2)), "'éè'");
    }

    #[test]
    fn insert_brackets_identifiers_and_joins_values() {
        let pairs = [("Col1", "'Value1'"), ("Col2", "'Value2'"), ("Col3", "'Value3'")];
        assert_eq!(
            build_insert("MyTableName", &pairs),
            "INSERT INTO [MyTableName] ([Col1],[Col2],[Col3]) VALUES ('Value1','Value2','Value3')"
        );
    }

    #[test]
    fn stored_dates_parse_in_both_shapes() {
        assert_eq!(
            parse_stored_date("2007-11-06 15:27:21"),
            Some(at(2007, 11, 6, 15, 27, 21))
        );
        assert_eq!(parse_stored_date("2007-11-06"), Some(at(2007, 11, 6, 0, 0, 0)));
        assert_eq!(parse_stored_date("#2017-09-30#"), Some(at(2017, 9, 30, 0, 0, 0)));
        assert_eq!(parse_stored_date("yesterday"), None);
    }
}
