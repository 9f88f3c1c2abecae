//! Parsing of tool output lines into progress deltas.
//!
//! The tool reports copy progress as a trailing parenthesized percentage and
//! the copy rate on its own marker line:
//!
//! ```text
//! Copied 3750000/5000000 rows (75%)
//! Current copy rate: 5420 rows/sec
//! ```

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PERCENT: Regex = Regex::new(r"\((\d+(?:\.\d+)?)%\)\s*$").unwrap();
    static ref COPY_RATE: Regex = Regex::new(r"Current copy rate:\s+(\d+(?:\.\d+)?)").unwrap();
}

/// Extract `(percent, rate)` from one log line. Either side is `0.0` when the
/// line carries no such marker; callers treat values `<= 0` as no update.
pub fn parse_progress(line: &str) -> (f64, f64) {
    let percent = PERCENT
        .captures(line)
        .and_then(|captures| captures[1].parse::<f64>().ok())
        .unwrap_or(0.0);
    let rate = COPY_RATE
        .captures(line)
        .and_then(|captures| captures[1].parse::<f64>().ok())
        .unwrap_or(0.0);
    (percent, rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_percentage() {
        let (percent, rate) = parse_progress("Copied 3750000/5000000 rows (75%)");
        assert_eq!(percent, 75.0);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn parses_fractional_percentage() {
        let (percent, _) = parse_progress("Copying `app`.`orders`:  41% 00:35 remain (41.5%)");
        assert_eq!(percent, 41.5);
    }

    #[test]
    fn parses_copy_rate() {
        let (percent, rate) = parse_progress("Current copy rate: 5420 rows/sec");
        assert_eq!(percent, 0.0);
        assert_eq!(rate, 5420.0);
    }

    #[test]
    fn percentage_must_be_trailing() {
        let (percent, _) = parse_progress("(75%) of the work remains to be scheduled");
        assert_eq!(percent, 0.0);
    }

    #[test]
    fn plain_lines_yield_no_update() {
        assert_eq!(parse_progress("Creating triggers..."), (0.0, 0.0));
        assert_eq!(parse_progress(""), (0.0, 0.0));
    }
}
