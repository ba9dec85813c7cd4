//! Capability Profiler: Device Grading for Route Selection
//!
//! This module samples the device signals the router cares about (GPU
//! presence and VRAM estimate, battery, system memory) and reduces them to a
//! coarse [`Grade`]. The snapshot is computed once per process and shared.
//!
//! ```text
//!   vram_estimate_mb
//!   ┌──────────┬──────────┬──────────┬──────────┐
//!   │  < 2048  │  ≥ 2048  │  ≥ 4096  │  ≥ 8192  │
//!   │    C     │    B     │    A     │    S     │
//!   └──────────┴──────────┴──────────┴──────────┘
//!     weakest                             best
//! ```
//!
//! ## Lifecycle
//!
//! [`CapabilityProfiler::profile()`] populates a `tokio::sync::OnceCell` on
//! first use. Concurrent first callers join the single in-flight computation.
//! There is no invalidation; the snapshot lives as long as the profiler.
//! [`CapabilityProfiler::global()`] is the process-wide instance.
//!
//! Connectivity is the exception: it changes too often to cache, so
//! [`CapabilityProfiler::is_online()`] asks the probe on every call.
//!
//! ## Probes
//!
//! Raw signals come from a [`DeviceProbe`]. Every probe method is
//! best-effort: an absent signal is reported as `None`, never as an error.
//! [`SystemProbe`] reads memory via `sysinfo` and battery from
//! `/sys/class/power_supply` on Linux. It reports no GPU; hosts with a real
//! accelerator inject a probe that knows about it.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::OnceCell;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// ============================================================================
// Grade
// ============================================================================

/// Coarse device capability tier, `S` best to `C` weakest.
///
/// Variants are declared weakest first so the derived `Ord` reads naturally
/// (`Grade::C < Grade::S`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    C,
    B,
    A,
    S,
}

/// Grade a VRAM estimate. Lower bounds are inclusive.
pub fn grade(vram_mb: u64) -> Grade {
    if vram_mb >= 8192 {
        Grade::S
    } else if vram_mb >= 4096 {
        Grade::A
    } else if vram_mb >= 2048 {
        Grade::B
    } else {
        Grade::C
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::S => "S",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Probe signals
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: String,
    pub name: String,
    /// Estimated dedicated memory in MiB.
    pub vram_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Charge level in `[0, 1]`.
    pub level: f64,
    pub charging: bool,
}

/// Immutable device snapshot consumed by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub gpu_present: bool,
    pub vram_estimate_mb: u64,
    pub grade: Grade,
    pub battery_level: Option<f64>,
    pub battery_charging: Option<bool>,
    pub system_memory_gb: f64,
}

impl DeviceStats {
    /// Build a snapshot from raw signals, deriving the grade.
    pub fn from_signals(
        gpu: Option<&GpuInfo>,
        battery: Option<BatteryInfo>,
        system_memory_gb: Option<f64>,
    ) -> Self {
        let vram_estimate_mb = gpu.map(|g| g.vram_mb).unwrap_or(0);
        Self {
            gpu_present: gpu.is_some(),
            vram_estimate_mb,
            grade: grade(vram_estimate_mb),
            battery_level: battery.map(|b| b.level.clamp(0.0, 1.0)),
            battery_charging: battery.map(|b| b.charging),
            system_memory_gb: system_memory_gb.unwrap_or(0.0),
        }
    }
}

/// Result of `HybridClient::capability()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub webgpu: bool,
    pub gpu: Option<GpuInfo>,
    pub grade: Grade,
    pub connection: ConnectionState,
    pub battery: Option<BatteryInfo>,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Source of raw device signals.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn gpu(&self) -> Option<GpuInfo>;

    async fn battery(&self) -> Option<BatteryInfo>;

    async fn system_memory_gb(&self) -> Option<f64>;

    /// Current connectivity. Sampled per request, never cached.
    async fn is_online(&self) -> bool;

    async fn webgpu_available(&self) -> bool {
        self.gpu().await.is_some()
    }
}

// ============================================================================
// SystemProbe
// ============================================================================

/// Default probe backed by `sysinfo` and the Linux power-supply class.
#[derive(Debug, Default, Clone)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceProbe for SystemProbe {
    async fn gpu(&self) -> Option<GpuInfo> {
        None
    }

    async fn battery(&self) -> Option<BatteryInfo> {
        tokio::task::spawn_blocking(read_power_supply)
            .await
            .ok()
            .flatten()
    }

    async fn system_memory_gb(&self) -> Option<f64> {
        // sysinfo reads /proc/meminfo and friends, which block.
        let total = tokio::task::spawn_blocking(|| {
            let mut sys = System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            );
            sys.refresh_memory();
            sys.total_memory()
        })
        .await
        .ok()?;

        (total > 0).then(|| total as f64 / GIB)
    }

    async fn is_online(&self) -> bool {
        true
    }

    async fn webgpu_available(&self) -> bool {
        false
    }
}

#[cfg(target_os = "linux")]
fn read_power_supply() -> Option<BatteryInfo> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_battery = std::fs::read_to_string(path.join("type"))
            .map(|t| t.trim() == "Battery")
            .unwrap_or(false);
        if !is_battery {
            continue;
        }
        let Some(capacity) = std::fs::read_to_string(path.join("capacity"))
            .ok()
            .and_then(|c| c.trim().parse::<f64>().ok())
        else {
            continue;
        };
        let charging = std::fs::read_to_string(path.join("status"))
            .map(|s| matches!(s.trim(), "Charging" | "Full"))
            .unwrap_or(false);
        return Some(BatteryInfo {
            level: (capacity / 100.0).clamp(0.0, 1.0),
            charging,
        });
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_power_supply() -> Option<BatteryInfo> {
    None
}

// ============================================================================
// CapabilityProfiler
// ============================================================================

/// Populate-once device profiler.
pub struct CapabilityProfiler {
    probe: Arc<dyn DeviceProbe>,
    stats: OnceCell<DeviceStats>,
}

impl std::fmt::Debug for CapabilityProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityProfiler")
            .field("stats", &self.stats.get())
            .finish()
    }
}

impl Default for CapabilityProfiler {
    fn default() -> Self {
        Self::new(Arc::new(SystemProbe::new()))
    }
}

static GLOBAL_PROFILER: OnceLock<Arc<CapabilityProfiler>> = OnceLock::new();

impl CapabilityProfiler {
    pub fn new(probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            probe,
            stats: OnceCell::new(),
        }
    }

    /// The process-wide profiler over [`SystemProbe`].
    pub fn global() -> Arc<CapabilityProfiler> {
        GLOBAL_PROFILER
            .get_or_init(|| Arc::new(CapabilityProfiler::default()))
            .clone()
    }

    /// Device snapshot, computed once and shared by every later caller.
    pub async fn profile(&self) -> DeviceStats {
        self.stats
            .get_or_init(|| async {
                let (gpu, battery, memory) = tokio::join!(
                    self.probe.gpu(),
                    self.probe.battery(),
                    self.probe.system_memory_gb(),
                );
                let stats = DeviceStats::from_signals(gpu.as_ref(), battery, memory);
                tracing::info!(
                    "CapabilityProfiler: grade={} gpu={} vram={}MB memory={:.1}GB battery={:?}",
                    stats.grade,
                    stats.gpu_present,
                    stats.vram_estimate_mb,
                    stats.system_memory_gb,
                    stats.battery_level,
                );
                stats
            })
            .await
            .clone()
    }

    /// Snapshot if already computed.
    pub fn cached(&self) -> Option<&DeviceStats> {
        self.stats.get()
    }

    pub async fn is_online(&self) -> bool {
        self.probe.is_online().await
    }

    /// Fresh capability report. Does not touch the cached snapshot.
    pub async fn capability(&self) -> CapabilityReport {
        let (webgpu, gpu, battery, memory, online) = tokio::join!(
            self.probe.webgpu_available(),
            self.probe.gpu(),
            self.probe.battery(),
            self.probe.system_memory_gb(),
            self.probe.is_online(),
        );
        let vram = gpu.as_ref().map(|g| g.vram_mb).unwrap_or(0);
        tracing::debug!("CapabilityProfiler: capability report vram={}MB online={}", vram, online);
        CapabilityReport {
            webgpu,
            grade: grade(vram),
            gpu,
            connection: if online {
                ConnectionState::Online
            } else {
                ConnectionState::Offline
            },
            battery,
            memory_gb: memory.unwrap_or(0.0),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(grade(0), Grade::C);
        assert_eq!(grade(2047), Grade::C);
        assert_eq!(grade(2048), Grade::B);
        assert_eq!(grade(4095), Grade::B);
        assert_eq!(grade(4096), Grade::A);
        assert_eq!(grade(8191), Grade::A);
        assert_eq!(grade(8192), Grade::S);
        assert_eq!(grade(u64::MAX), Grade::S);
    }

    #[test]
    fn test_grade_ordering() {
        assert!(Grade::C < Grade::B);
        assert!(Grade::B < Grade::A);
        assert!(Grade::A < Grade::S);
    }

    #[test]
    fn test_missing_gpu_forces_grade_c() {
        let stats = DeviceStats::from_signals(None, None, Some(16.0));
        assert!(!stats.gpu_present);
        assert_eq!(stats.vram_estimate_mb, 0);
        assert_eq!(stats.grade, Grade::C);
        assert!(stats.battery_level.is_none());
        assert!(stats.battery_charging.is_none());
    }

    struct CountingProbe {
        gpu_calls: AtomicUsize,
        online: bool,
    }

    #[async_trait]
    impl DeviceProbe for CountingProbe {
        async fn gpu(&self) -> Option<GpuInfo> {
            self.gpu_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some(GpuInfo {
                vendor: "acme".into(),
                name: "rx".into(),
                vram_mb: 4096,
            })
        }

        async fn battery(&self) -> Option<BatteryInfo> {
            Some(BatteryInfo {
                level: 0.5,
                charging: false,
            })
        }

        async fn system_memory_gb(&self) -> Option<f64> {
            Some(8.0)
        }

        async fn is_online(&self) -> bool {
            self.online
        }
    }

    #[tokio::test]
    async fn test_profile_is_single_flight() {
        let probe = Arc::new(CountingProbe {
            gpu_calls: AtomicUsize::new(0),
            online: true,
        });
        let profiler = Arc::new(CapabilityProfiler::new(probe.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let profiler = profiler.clone();
                tokio::spawn(async move { profiler.profile().await })
            })
            .collect();
        for handle in handles {
            let stats = handle.await.unwrap();
            assert_eq!(stats.grade, Grade::A);
            assert_eq!(stats.battery_level, Some(0.5));
        }

        assert_eq!(probe.gpu_calls.load(Ordering::SeqCst), 1);
        assert!(profiler.cached().is_some());
    }

    #[tokio::test]
    async fn test_connectivity_not_cached() {
        let profiler = CapabilityProfiler::new(Arc::new(CountingProbe {
            gpu_calls: AtomicUsize::new(0),
            online: false,
        }));
        assert!(!profiler.is_online().await);
        let report = profiler.capability().await;
        assert_eq!(report.connection, ConnectionState::Offline);
        assert!(report.webgpu);
        assert_eq!(report.grade, Grade::A);
    }

    #[tokio::test]
    async fn test_system_probe_is_best_effort() {
        let probe = SystemProbe::new();
        assert!(probe.gpu().await.is_none());
        assert!(!probe.webgpu_available().await);
        if let Some(battery) = probe.battery().await {
            assert!((0.0..=1.0).contains(&battery.level));
        }
        let stats = CapabilityProfiler::new(Arc::new(probe)).profile().await;
        assert_eq!(stats.grade, Grade::C);
    }

    #[test]
    fn test_profiler_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CapabilityProfiler>();
    }
}
