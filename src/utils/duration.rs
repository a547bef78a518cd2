use crate::constants::network::MAX_CONNECT_TIMEOUT_SECS;
use crate::errors::RemoteError;
use std::time::Duration;

/// Parses `30s`, `5m`, `1h`, `1m30s`, `250ms`; a bare number is seconds.
/// Values above one day are rejected.
pub fn parse_duration(raw: &str) -> Result<Duration, RemoteError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(RemoteError::invalid_params("timeout must not be empty"));
    }
    let max = Duration::from_secs(MAX_CONNECT_TIMEOUT_SECS);
    let too_long = || {
        RemoteError::invalid_params(format!(
            "timeout '{}' exceeds the maximum of {}s",
            raw, MAX_CONNECT_TIMEOUT_SECS
        ))
    };
    if text.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = text.parse().map_err(|_| too_long())?;
        let total = Duration::from_secs(secs);
        return if total > max { Err(too_long()) } else { Ok(total) };
    }

    let invalid = || {
        RemoteError::invalid_params(format!("timeout '{}' is not a valid duration", raw))
            .with_hint("Use a value like `30s`, `5m` or `1m30s`.")
    };

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| too_long())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(too_long)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(too_long)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(part).ok_or_else(too_long)?;
        if total > max {
            return Err(too_long());
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("1").unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_values_beyond_one_day() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        for raw in [
            "86401",
            "18446744073709551615",
            "99999999999999999999999",
            "307445734561825861m",
            "5124095576030432h",
            "18446744073709551615s1s",
        ] {
            let err = parse_duration(raw).unwrap_err();
            assert!(err.message.contains("exceeds the maximum"), "{}", raw);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
