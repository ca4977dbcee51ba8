//! Process resource sampling for occurrence performance metrics.

use faultline_state::PerformanceMetrics;

/// Resident memory and thread count of the current process.
///
/// Only Linux exposes these cheaply; elsewhere both are `None`.
pub fn sample(response_time_ms: f64) -> PerformanceMetrics {
    let (memory_bytes, thread_count) = read_status();
    PerformanceMetrics {
        response_time_ms: Some(response_time_ms),
        memory_bytes,
        thread_count,
    }
}

#[cfg(target_os = "linux")]
fn read_status() -> (Option<u64>, Option<u32>) {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => parse_status(&status),
        Err(e) => {
            tracing::trace!(error = %e, "Could not read /proc/self/status");
            (None, None)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_status() -> (Option<u64>, Option<u32>) {
    (None, None)
}

fn parse_status(status: &str) -> (Option<u64>, Option<u32>) {
    let mut memory = None;
    let mut threads = None;

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            // Reported in kB.
            memory = rest
                .split_whitespace()
                .next()
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| kb * 1024);
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse::<u32>().ok();
        }
    }

    (memory, threads)
}
