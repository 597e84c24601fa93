// Host discovery for the CLI and for sizing the native pool. GPU adapters come
// from wgpu, so the list matches what the GPU engine can negotiate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub vendor_id: u32,
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub cores: usize,
    pub cpu_model: Option<String>,
    pub memory: MemoryInfo,
    pub adapters: Vec<AdapterSummary>,
}

pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn host_info() -> HostInfo {
    let memory = std::fs::read_to_string("/proc/meminfo")
        .map(|text| parse_meminfo(&text))
        .unwrap_or_default();
    let cpu_model = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| parse_cpu_model(&text));

    HostInfo { cores: available_parallelism(), cpu_model, memory, adapters: gpu_adapters() }
}

// Values in /proc/meminfo are kB.
fn parse_meminfo(text: &str) -> MemoryInfo {
    let mut info = MemoryInfo::default();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => info.total = kb * 1024,
            "MemAvailable:" => info.available = kb * 1024,
            _ => {}
        }
    }
    info
}

fn parse_cpu_model(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| line.starts_with("model name"))
        .find_map(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_string())
        .filter(|model| !model.is_empty())
}

pub fn gpu_adapters() -> Vec<AdapterSummary> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapters: Vec<AdapterSummary> = instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .map(|adapter| {
            let info = adapter.get_info();
            AdapterSummary {
                name: info.name,
                backend: format!("{:?}", info.backend).to_lowercase(),
                device_type: format!("{:?}", info.device_type),
                vendor_id: info.vendor,
                driver: Some(info.driver).filter(|d| !d.is_empty()),
            }
        })
        .collect();
    tracing::debug!("found {} gpu adapters", adapters.len());
    adapters
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    match unit {
        0 => format!("{} B", bytes),
        3 => format!("{:.1} GB", value),
        _ => format!("{:.0} {}", value, UNITS[unit]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16384 kB\nMemFree:  100 kB\nMemAvailable:    8192 kB\nbroken\n";
        assert_eq!(parse_meminfo(text), MemoryInfo { total: 16384 * 1024, available: 8192 * 1024 });
        assert_eq!(parse_meminfo("garbage"), MemoryInfo::default());
    }

    #[test]
    fn test_parse_cpu_model() {
        let text = "processor\t: 0\nmodel name\t: Example CPU @ 3.0GHz\n";
        assert_eq!(parse_cpu_model(text).as_deref(), Some("Example CPU @ 3.0GHz"));
        assert_eq!(parse_cpu_model("processor\t: 0\n"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(128 * 1024 * 1024), "128 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }

    #[test]
    fn test_host_info_cores() {
        assert!(available_parallelism() >= 1);
        assert_eq!(host_info().cores, available_parallelism());
    }
}
