use serde::Serialize;

/// Lower bound for every wall-clock timeout.
pub const MIN_TIMEOUT_SECS: u64 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct ExecLimits {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitSources {
    pub timeout_secs: &'static str, // "param" | "env" | "default"
    pub max_output_bytes: &'static str, // "env" | "default"
}

pub fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

pub fn parse_env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

/// Clamp a requested timeout into `[MIN_TIMEOUT_SECS, max_timeout]`.
///
/// Oversized requests are clamped, never rejected.
pub fn clamp_timeout(requested: u64, max_timeout: u64) -> u64 {
    clamp(requested, MIN_TIMEOUT_SECS, max_timeout.max(MIN_TIMEOUT_SECS))
}

/// Resolve limits for one command execution.
/// - timeout_secs: from param → env(WARDEN_DEFAULT_TIMEOUT) → default, clamped [1..max_timeout]
/// - max_output_bytes: from env(WARDEN_MAX_OUTPUT_SIZE) → default, at least 1 byte
pub fn resolve_exec_limits(
    param_timeout_secs: Option<u64>,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    default_max_output: usize,
) -> (ExecLimits, LimitSources) {
    let (timeout_secs, timeout_src) = if let Some(p) = param_timeout_secs {
        (clamp_timeout(p, max_timeout_secs), "param")
    } else if let Some(envv) = parse_env_u64("WARDEN_DEFAULT_TIMEOUT") {
        (clamp_timeout(envv, max_timeout_secs), "env")
    } else {
        (clamp_timeout(default_timeout_secs, max_timeout_secs), "default")
    };

    let (max_output_bytes, output_src) = match parse_env_u64("WARDEN_MAX_OUTPUT_SIZE") {
        Some(envv) => (envv.max(1) as usize, "env"),
        None => (default_max_output.max(1), "default"),
    };

    let effective = ExecLimits {
        timeout_secs,
        max_output_bytes,
    };
    let sources = LimitSources {
        timeout_secs: timeout_src,
        max_output_bytes: output_src,
    };
    (effective, sources)
}
