//! Isolate meta file parser and kill-reason normalization.
//!
//! Isolate writes a `key:value` meta file after every run; this module
//! turns it into measured resource usage plus an authoritative kill
//! reason checked against the requested limits.

use serde::Serialize;

use super::Limits;

/// Why the sandbox terminated the child, if it did.
///
/// The kill reason is authoritative over the exit status: a child that
/// exited cleanly but overran its cpu cap still counts as cpu-killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KillReason {
    /// No limit tripped
    None,
    /// CPU time cap breached
    #[serde(rename = "TO")]
    Cpu,
    /// Wall clock cap breached
    #[serde(rename = "WT")]
    Wall,
    /// Killed by signal
    #[serde(rename = "SG")]
    Signal,
    /// Memory cap breached
    #[serde(rename = "ML")]
    Memory,
    /// Sandbox-internal failure
    #[serde(rename = "XX")]
    Internal,
}

impl KillReason {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            KillReason::None => None,
            KillReason::Cpu => Some("TO"),
            KillReason::Wall => Some("WT"),
            KillReason::Signal => Some("SG"),
            KillReason::Memory => Some("ML"),
            KillReason::Internal => Some("XX"),
        }
    }
}

/// Parsed meta file contents.
#[derive(Debug, Clone, Default)]
pub struct RawMeta {
    /// Summed user+system cpu of the child tree, milliseconds
    pub cpu_ms: u64,
    /// Wall clock from fork to final reap, milliseconds
    pub wall_ms: u64,
    /// Peak RSS of the child tree, KiB
    pub peak_mem_kib: u64,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub status: String,
    pub message: String,
}

/// Parse isolate's meta file.
pub fn parse_meta(content: &str) -> RawMeta {
    let mut meta = RawMeta::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.cpu_ms = (t * 1000.0) as u64;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_ms = (t * 1000.0) as u64;
                }
            }
            // cg-mem with cgroups, max-rss without; both in KiB
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u64>() {
                    meta.peak_mem_kib = meta.peak_mem_kib.max(m);
                }
            }
            "exitcode" => {
                meta.exit_code = value.parse().unwrap_or(0);
            }
            "exitsig" => {
                meta.signal = value.parse().ok();
            }
            "status" => {
                meta.status = value.to_string();
            }
            "message" => {
                meta.message = value.to_string();
            }
            _ => {}
        }
    }

    meta
}

/// Derive the kill reason from the meta file and the requested limits.
pub fn classify(meta: &RawMeta, limits: &Limits) -> KillReason {
    if meta.status == "XX" {
        return KillReason::Internal;
    }

    let mut reason = match meta.status.as_str() {
        // isolate reports both cpu and wall breaches as TO; split on the
        // measured cpu time
        "TO" => {
            if meta.cpu_ms >= limits.cpu_ms {
                KillReason::Cpu
            } else {
                KillReason::Wall
            }
        }
        "SG" => KillReason::Signal,
        _ => KillReason::None,
    };

    // cpu overrun counts even when the child exited before the kill landed
    if reason == KillReason::None && meta.cpu_ms > limits.cpu_ms {
        reason = KillReason::Cpu;
    }

    // memory breach is authoritative over everything but XX
    if meta.peak_mem_kib > limits.memory_kib {
        reason = KillReason::Memory;
    }

    reason
}
