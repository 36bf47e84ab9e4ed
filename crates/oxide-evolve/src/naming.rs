//! Migration naming conventions.

use chrono::{DateTime, Utc};

/// Returns the leading number of a migration name, e.g. `3` for `0003_add_email`.
#[must_use]
pub fn parse_number(name: &str) -> Option<u32> {
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Name for a squash of `first..=last`: `<first's number>_squashed_<last>`.
///
/// The number keeps `first`'s own digits and falls back to `0001` when
/// `first` has none.
#[must_use]
pub fn squashed_name(first: &str, last: &str) -> String {
    let digits: String = first.chars().take_while(char::is_ascii_digit).collect();
    let number = if digits.is_empty() {
        "0001".to_string()
    } else {
        digits
    };
    format!("{number}_squashed_{last}")
}

/// Name for a merge of migrations numbered `numbers`.
#[must_use]
pub fn merge_name(numbers: impl IntoIterator<Item = u32>) -> String {
    let next = numbers.into_iter().max().unwrap_or(0) + 1;
    format!("{next:04}_merge")
}

/// Timestamped fallback name for an unnamed migration.
#[must_use]
pub fn auto_name(number: u32, now: DateTime<Utc>) -> String {
    format!("{number:04}_auto_{}", now.format("%Y%m%d_%H%M"))
}
