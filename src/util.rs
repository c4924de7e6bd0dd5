/*!
Miscellaneous utilities for `stockcast`
*/

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use num::{Float, NumCast};

/// Round a floating point value to a given number of decimal places
pub fn round_to<F: Float>(value: F, decimals: u32) -> F {
    let factor: F = NumCast::from(10u64.pow(decimals)).unwrap_or_else(F::one);
    (value * factor).round() / factor
}

/// Divide, returning `default` when the denominator is zero or the result is not finite
pub fn safe_div<F: Float>(numerator: F, denominator: F, default: F) -> F {
    if denominator == F::zero() {
        return default;
    }
    let result = numerator / denominator;
    if result.is_finite() {
        result
    } else {
        default
    }
}

/// Whether a date falls on a weekday
#[inline]
pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// The first weekday strictly after `date`
pub fn next_weekday(date: NaiveDate) -> NaiveDate {
    let mut next = date + Duration::days(1);
    while !is_weekday(next) {
        next = next + Duration::days(1);
    }
    next
}

/// The `n` weekdays following `date`, in order
pub fn following_weekdays(date: NaiveDate, n: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n);
    let mut current = date;
    for _ in 0..n {
        current = next_weekday(current);
        days.push(current);
    }
    days
}
