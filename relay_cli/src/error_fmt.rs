//! Human-readable error descriptions and structured JSON error formatting.

use relay_core::RelayError;

/// Short stable name for the error kind, used as the JSON `reason`.
fn reason_name(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<RelayError>() {
        Some(RelayError::Sensor(_) | RelayError::Timeout) => "Sensor",
        Some(RelayError::Storage(_)) => "Storage",
        Some(RelayError::Malformed(_)) => "Malformed",
        Some(RelayError::Transport(_)) => "Transport",
        Some(RelayError::Setup(_)) => "Setup",
        Some(RelayError::Config(_)) => "Config",
        None if looks_like_config(&err.to_string()) => "Config",
        None => "Error",
    }
}

fn looks_like_config(msg: &str) -> bool {
    msg.starts_with("read config") || msg.starts_with("parse config") || msg.contains(" must ")
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(re) = err.downcast_ref::<RelayError>() {
        return match re {
            RelayError::Timeout => "What happened: Sensor read timed out.\nLikely causes: ADC or UART not wired correctly, no power, or timing.sample_timeout_ms too low.\nHow to fix: Check the sensor wiring and power, and consider raising timing.sample_timeout_ms.".to_string(),
            RelayError::Sensor(msg) => format!(
                "What happened: Sensor read failed ({msg}).\nLikely causes: I2C/UART bus unavailable or the sensor is not responding.\nHow to fix: Verify wiring and that I2C/serial are enabled, then run `relay self-check`."
            ),
            RelayError::Storage(msg) => format!(
                "What happened: Local storage failed ({msg}).\nLikely causes: data_dir missing, read-only, or the disk is full.\nHow to fix: Check storage.data_dir permissions and free space."
            ),
            RelayError::Setup(msg) if msg.contains("resolve") || msg.contains("no addresses") => format!(
                "What happened: Broker host could not be resolved ({msg}).\nLikely causes: Typo in broker.host or DNS not configured on this node.\nHow to fix: Fix [broker] host in the config, or check /etc/resolv.conf."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.starts_with("read config") {
        return format!(
            "What happened: Config file could not be read.\nLikely causes: Wrong --config path or missing file.\nHow to fix: Pass --config <FILE> or create etc/relay.toml. Original: {msg}"
        );
    }

    if lower.starts_with("parse config") {
        return format!(
            "What happened: Config file is not valid TOML for this program.\nLikely causes: Missing [node] or [broker] section, or a misspelled key.\nHow to fix: Compare with the sample config. Original: {msg}"
        );
    }

    if lower.contains(" must ") {
        return format!(
            "What happened: Configuration is invalid ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
        );
    }

    if lower.contains("hardware") && lower.contains("feature") {
        return "What happened: Real sensors requested on a simulation-only build.\nLikely causes: Binary built without --features hardware.\nHow to fix: Rebuild with `--features hardware`, or set sensor.kind = \"simulated\".".to_string();
    }

    if lower.contains("open methane sensors") {
        return "What happened: Failed to open the sensor bus.\nLikely causes: I2C or serial not enabled, wrong uart_path, or insufficient permissions.\nHow to fix: Enable I2C/UART (raspi-config), check [sensor] uart_path, and add the user to the i2c and dialout groups.".to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;
    json!({ "reason": reason_name(err), "message": humanize(err) }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_get_specific_hints() {
        let e = eyre::Report::new(RelayError::Setup("cannot resolve broker x:1883: nope".into()));
        assert!(humanize(&e).contains("could not be resolved"));
        assert_eq!(reason_name(&e), "Setup");
    }

    #[test]
    fn validation_messages_read_as_config_errors() {
        let e = eyre::eyre!("broker.host must not be empty");
        assert!(humanize(&e).starts_with("What happened: Configuration is invalid"));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&e)).unwrap();
        assert_eq!(v["reason"], "Config");
    }

    #[test]
    fn wrapped_typed_errors_are_still_found() {
        use eyre::WrapErr;
        let r: Result<(), RelayError> = Err(RelayError::Storage("disk full".into()));
        let e = r.wrap_err("append").unwrap_err();
        assert!(humanize(&e).contains("Local storage failed"));
    }
}
