//! Wire types for the realtime telemetry feed.
//!
//! The agent pushes one JSON object per text frame. [`Envelope`] is the
//! schema-agnostic decoded frame the channel hands to listeners;
//! [`TelemetrySnapshot`] is the typed shape the agent actually serializes,
//! field for field. Consumers that only care about part of a snapshot can
//! decode their own narrower struct from the envelope instead.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded inbound frame.
///
/// The channel never interprets the contents; it only guarantees the frame
/// was valid JSON. Use [`Envelope::decode`] to project it onto a typed view.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope(Value);

impl Envelope {
    /// Parses one text frame into an envelope.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self)
    }

    /// The raw JSON value.
    pub fn raw(&self) -> &Value {
        &self.0
    }

    /// Decodes the envelope into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }
}

impl From<Value> for Envelope {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// One full telemetry snapshot as pushed by the agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Unix timestamp (seconds) the snapshot was taken at.
    pub timestamp: i64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
    pub network: NetworkMetrics,
    pub load_average: LoadAverage,
    pub uptime_secs: u64,
    /// Absent on hosts without a supported GPU.
    pub gpu: Option<Vec<GpuMetrics>>,
    pub ports: Vec<PortEntry>,
    pub processes: Vec<ProcessEntry>,
    pub docker_containers: Vec<ContainerMetrics>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Aggregate usage across all cores, percent.
    pub total_usage: f32,
    /// Per-core usage, percent.
    pub core_usage: Vec<f32>,
    pub temperature_celsius: Option<f32>,
    pub power_watts: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_kb: u64,
    pub used_kb: u64,
    pub free_kb: u64,
    pub used_percent: f32,
    pub swap_total_kb: u64,
    pub swap_used_kb: u64,
    pub swap_free_kb: u64,
    pub swap_used_percent: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_percent: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub interfaces: Vec<InterfaceInfo>,
    pub rx_speed_kbps: f64,
    pub tx_speed_kbps: f64,
    pub total_rx_gb: f64,
    pub total_tx_gb: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub name: String,
    pub index: u32,
    pub memory_total_mb: u32,
    pub memory_used_mb: u32,
    pub memory_free_mb: u32,
    pub utilization_percent: u8,
    pub temperature_celsius: u8,
    pub power_draw_watts: Option<f32>,
    pub power_limit_watts: Option<f32>,
    pub fan_speed_percent: Option<u8>,
    pub graphics_clock_mhz: Option<u32>,
    pub memory_clock_mhz: Option<u32>,
}

/// One listening or established socket on the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Socket state as reported by the kernel, e.g. `LISTEN`.
    pub state: String,
    pub program: String,
    pub pid: Option<u32>,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_mb: f64,
    pub status: String,
    pub user: Option<String>,
    pub command: String,
    pub start_time: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Human-readable status line, e.g. `Up 3 days`.
    pub status: String,
    pub state: ContainerState,
    pub created: i64,
    pub ports: Vec<PortMapping>,
    pub cpu_percent: f32,
    pub memory_usage_mb: f64,
    pub memory_limit_mb: f64,
    pub memory_percent: f32,
    pub network_rx_mb: f64,
    pub network_tx_mb: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub dead: bool,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
    pub host_ip: Option<String>,
}

/// Full agent snapshot used by tests across the crate.
#[cfg(test)]
pub(crate) const SAMPLE_SNAPSHOT: &str = r#"{
        "timestamp": 1722945600,
        "cpu": {
            "total_usage": 12.5,
            "core_usage": [10.0, 15.0],
            "temperature_celsius": 48.0,
            "power_watts": null
        },
        "memory": {
            "total_kb": 16384000,
            "used_kb": 8192000,
            "free_kb": 8192000,
            "used_percent": 50.0,
            "swap_total_kb": 2048000,
            "swap_used_kb": 0,
            "swap_free_kb": 2048000,
            "swap_used_percent": 0.0
        },
        "disks": [{
            "name": "nvme0n1p2",
            "mount_point": "/",
            "file_system": "ext4",
            "total_gb": 476.0,
            "used_gb": 120.5,
            "free_gb": 355.5,
            "used_percent": 25.3
        }],
        "network": {
            "interfaces": [{
                "name": "eth0",
                "ipv4": ["192.168.1.20"],
                "ipv6": []
            }],
            "rx_speed_kbps": 128.0,
            "tx_speed_kbps": 64.0,
            "total_rx_gb": 10.2,
            "total_tx_gb": 3.4
        },
        "load_average": { "one": 0.5, "five": 0.4, "fifteen": 0.3 },
        "uptime_secs": 86400,
        "gpu": null,
        "ports": [{
            "port": 22,
            "protocol": "tcp",
            "state": "LISTEN",
            "program": "sshd",
            "pid": 812,
            "address": "0.0.0.0"
        }],
        "processes": [{
            "pid": 1,
            "name": "systemd",
            "cpu_percent": 0.1,
            "memory_percent": 0.2,
            "memory_mb": 12.0,
            "status": "sleeping",
            "user": "root",
            "command": "/sbin/init",
            "start_time": 1722859200
        }],
        "docker_containers": [{
            "id": "abc123def456",
            "name": "caddy",
            "image": "caddy:2",
            "status": "Up 3 days",
            "state": {
                "running": true,
                "paused": false,
                "restarting": false,
                "dead": false,
                "pid": 4242,
                "exit_code": null,
                "started_at": "2025-08-03T10:00:00Z",
                "finished_at": null
            },
            "created": 1722600000,
            "ports": [{
                "container_port": 80,
                "host_port": 8080,
                "protocol": "tcp",
                "host_ip": "0.0.0.0"
            }],
            "cpu_percent": 0.5,
            "memory_usage_mb": 24.0,
            "memory_limit_mb": 512.0,
            "memory_percent": 4.7,
            "network_rx_mb": 1.2,
            "network_tx_mb": 0.8
        }]
    }"#;

#[cfg(test)]
mod tests {
    use super::{Envelope, TelemetrySnapshot, SAMPLE_SNAPSHOT};

    #[test]
    fn full_snapshot_decodes_from_agent_json() {
        let envelope = Envelope::from_text(SAMPLE_SNAPSHOT).expect("frame should be valid json");
        let snapshot: TelemetrySnapshot = envelope.decode().expect("decode snapshot");

        assert_eq!(snapshot.timestamp, 1722945600);
        assert_eq!(snapshot.cpu.core_usage.len(), 2);
        assert_eq!(snapshot.memory.used_percent, 50.0);
        assert_eq!(snapshot.disks[0].mount_point, "/");
        assert_eq!(snapshot.network.interfaces[0].name, "eth0");
        assert!(snapshot.gpu.is_none());
        assert_eq!(snapshot.ports[0].program, "sshd");
        assert_eq!(snapshot.processes[0].user.as_deref(), Some("root"));
        assert!(snapshot.docker_containers[0].state.running);
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert!(Envelope::from_text("{not json").is_err());
    }

    #[test]
    fn envelope_exposes_raw_value() {
        let envelope = Envelope::from_text(r#"{"timestamp": 7}"#).expect("valid frame");
        assert_eq!(envelope.raw()["timestamp"], 7);
    }

    #[test]
    fn partial_views_can_be_decoded() {
        #[derive(serde::Deserialize)]
        struct TimestampOnly {
            timestamp: i64,
        }

        let envelope = Envelope::from_text(SAMPLE_SNAPSHOT).expect("valid frame");
        let view: TimestampOnly = envelope.decode().expect("narrow decode");
        assert_eq!(view.timestamp, 1722945600);
    }
}
