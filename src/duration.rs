//! Human-readable durations for command-line options.

use std::time::Duration;

/// Parse a duration such as `5s`, `2m`, `500ms` or `1h`.
///
/// A bare number is interpreted as seconds. Zero is rejected because every
/// duration option bounds a wait that must be able to elapse.
///
/// # Examples
/// ```
/// use switchbot_meter_bridge::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be checked before "m" and "s"
    let (number, millis_per_unit) = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1000)]
        .into_iter()
        .find_map(|(suffix, factor)| src.strip_suffix(suffix).map(|n| (n, factor)))
        .unwrap_or((src, 1000));

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    let millis = value
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("duration too large: {src}"))?;

    if millis == 0 {
        return Err(format!("duration must be greater than zero: {src}"));
    }

    Ok(Duration::from_millis(millis))
}
