//! Parsing of Kubernetes resource quantities as reported by the metrics API.
//!
//! Malformed values yield `None`; metrics are best effort and never fail a
//! surrounding fetch.

use tracing::debug;

/// CPU quantity to millicores.
///
/// `250m` → 250, `2` → 2000, `0.5` → 500, `1500000n` → 2 (rounded),
/// `750u` → 1 (rounded).
pub fn parse_cpu_millicores(raw: &str) -> Option<u64> {
    let s = raw.trim();
    let parsed = if let Some(v) = s.strip_suffix('m') {
        v.parse::<f64>().ok()
    } else if let Some(v) = s.strip_suffix('n') {
        v.parse::<f64>().ok().map(|n| n / 1_000_000.0)
    } else if let Some(v) = s.strip_suffix('u') {
        v.parse::<f64>().ok().map(|n| n / 1_000.0)
    } else {
        s.parse::<f64>().ok().map(|cores| cores * 1000.0)
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v.round() as u64),
        _ => {
            debug!(value = %raw, "quantity: unparseable cpu");
            None
        }
    }
}

/// Memory quantity to megabytes (MiB based).
///
/// `512Mi` → 512, `1Gi` → 1024, `2048Ki` → 2, `1M` → 1, `1G` → 1024, and a
/// bare number is bytes.
pub fn parse_memory_mb(raw: &str) -> Option<f64> {
    const UNITS: [(&str, f64); 7] = [
        ("Ki", 1.0 / 1024.0),
        ("Mi", 1.0),
        ("Gi", 1024.0),
        ("Ti", 1024.0 * 1024.0),
        ("K", 1.0 / 1024.0),
        ("M", 1.0),
        ("G", 1024.0),
    ];
    let s = raw.trim();
    let (num, factor) = UNITS
        .iter()
        .find_map(|(suffix, f)| s.strip_suffix(suffix).map(|n| (n, *f)))
        .unwrap_or((s, 1.0 / (1024.0 * 1024.0)));
    match num.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v * factor),
        _ => {
            debug!(value = %raw, "quantity: unparseable memory");
            None
        }
    }
}
