#![allow(clippy::redundant_pub_crate)]

//! Field-level validation helpers.

use std::path::Path;

use crate::error::{ConfigError, ConfigResult};

const PROXY_SCHEMES: [&str; 4] = ["http://", "https://", "socks5://", "socks5h://"];
const TRACKER_SCHEMES: [&str; 4] = ["udp://", "http://", "https://", "wss://"];

pub(crate) fn port(value: i32, field: &'static str) -> ConfigResult<()> {
    if value <= 0 {
        return Err(invalid(field, value.to_string(), "must be positive"));
    }
    if value > i32::from(u16::MAX) {
        return Err(invalid(field, value.to_string(), "must be at most 65535"));
    }
    Ok(())
}

pub(crate) fn non_empty_path(value: &Path, field: &'static str) -> ConfigResult<()> {
    if value.as_os_str().is_empty() {
        return Err(ConfigError::InvalidField {
            field,
            value: None,
            reason: "must not be empty",
        });
    }
    Ok(())
}

pub(crate) fn ratio(value: f64, field: &'static str) -> ConfigResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(field, value.to_string(), "must be a finite non-negative number"));
    }
    Ok(())
}

pub(crate) fn rate(value: Option<u64>, field: &'static str) -> ConfigResult<()> {
    if value == Some(0) {
        return Err(invalid(field, "0".to_string(), "must be positive when set"));
    }
    Ok(())
}

pub(crate) fn proxy_url(value: &str, field: &'static str) -> ConfigResult<()> {
    let trimmed = value.trim();
    let Some(scheme) = PROXY_SCHEMES.iter().find(|scheme| trimmed.starts_with(**scheme)) else {
        return Err(invalid(field, value.to_string(), "unsupported proxy scheme"));
    };
    if trimmed.len() == scheme.len() {
        return Err(invalid(field, value.to_string(), "missing proxy host"));
    }
    Ok(())
}

pub(crate) fn tracker_url(value: &str, field: &'static str) -> ConfigResult<()> {
    if TRACKER_SCHEMES
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len())
    {
        Ok(())
    } else {
        Err(invalid(field, value.to_string(), "unsupported tracker url"))
    }
}

fn invalid(field: &'static str, value: String, reason: &'static str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        value: Some(value),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_accepts_valid_range() {
        assert!(port(6_881, "incoming_port").is_ok());
        assert!(port(65_535, "incoming_port").is_ok());
    }

    #[test]
    fn port_rejects_out_of_range() {
        let err = port(70_000, "incoming_port").unwrap_err();
        assert_eq!(err.reason(), "must be at most 65535");
        let err = port(0, "incoming_port").unwrap_err();
        assert_eq!(err.reason(), "must be positive");
    }

    #[test]
    fn ratio_rejects_negative_and_nan() {
        assert!(ratio(0.0, "seed_ratio").is_ok());
        assert!(ratio(-0.5, "seed_ratio").is_err());
        assert!(ratio(f64::NAN, "seed_ratio").is_err());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(rate(None, "upload_rate").is_ok());
        assert!(rate(Some(1_024), "upload_rate").is_ok());
        assert!(rate(Some(0), "upload_rate").is_err());
    }

    #[test]
    fn proxy_requires_known_scheme_and_host() {
        assert!(proxy_url("socks5://127.0.0.1:1080", "proxy_url").is_ok());
        assert!(proxy_url("ftp://proxy", "proxy_url").is_err());
        assert!(proxy_url("http://", "proxy_url").is_err());
    }

    #[test]
    fn tracker_urls_are_checked() {
        assert!(tracker_url("udp://tracker.example:1337/announce", "trackers").is_ok());
        assert!(tracker_url("tracker.example", "trackers").is_err());
    }
}
