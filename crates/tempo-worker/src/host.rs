//! Facts about the machine the worker runs on. Metrics are best-effort and
//! only available on Linux.

use std::net::UdpSocket;

pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Address of the interface that routes outward. Connecting a UDP socket
/// sends nothing.
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// One-minute load average as a share of available cores.
pub fn cpu_percent() -> Option<f32> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load: f32 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().ok()?.get() as f32;
    Some((load / cores * 100.0).min(100.0))
}

pub fn memory_percent() -> Option<f32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<f32> {
    let field = |name: &str| -> Option<f32> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_share_from_meminfo() {
        let sample = "MemTotal:       16000000 kB\nMemFree:         2000000 kB\nMemAvailable:    4000000 kB\n";
        let pct = parse_meminfo(sample).unwrap();
        assert!((pct - 75.0).abs() < 0.01);
        assert!(parse_meminfo("MemTotal: 0 kB\n").is_none());
    }
}
