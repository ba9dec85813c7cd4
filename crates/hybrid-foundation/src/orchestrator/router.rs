//! Routing Strategy: Pure Local/Cloud Decision Tree
//!
//! [`decide_route`] picks the backend for one request from the configured
//! backends, the device snapshot, connectivity and an optional forced
//! provider. It does no I/O and keeps no state, so identical inputs always
//! give an identical decision.
//!
//! ## Decision Tree
//!
//! The checks run in this fixed order and the first match wins:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      request arrives                             │
//! └────────────────────────┬─────────────────────────────────────────┘
//!                          ▼
//!              force set? ── yes ──▶ that side (missing → no-provider)
//!                          │ no
//!                          ▼
//!         only one side configured? ── yes ──▶ that side
//!                          │ no
//!                          ▼
//!         neither configured? ── yes ──▶ no-provider
//!                          │ both
//!                          ▼
//!   ┌──────────────────────────────────────────┐
//!   │ local disqualifiers (in order)           │
//!   │   no GPU                 → no-gpu        │
//!   │   grade C                → weak-device   │
//!   │   battery < 15%, unplugged → low-battery │
//!   └──────────┬───────────────────┬───────────┘
//!        none  │                   │ matched
//!              ▼                   ▼
//!      local ready?           online? ── yes ──▶ cloud (reason)
//!     yes │     │ no               │ no
//!         ▼     ▼                  ▼
//!      local   cloud          local (offline-fallback)
//!              (local-loading)
//! ```
//!
//! Forced routing ignores readiness and capability. The caller is
//! responsible for awaiting local readiness upstream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::InferenceBackend;
use super::error::{InferenceError, InferenceResult};
use super::telemetry::{DeviceStats, Grade};
use super::types::Provider;

/// Battery level below which an unplugged device stops running local inference.
pub const LOW_BATTERY_THRESHOLD: f64 = 0.15;

// ============================================================================
// RouteReason
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteReason {
    LocalUnavailable,
    LocalLoading,
    /// The local attempt failed and the request fell back to cloud.
    LocalError,
    LowBattery,
    WeakDevice,
    NoGpu,
    OfflineFallback,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalUnavailable => "local-unavailable",
            Self::LocalLoading => "local-loading",
            Self::LocalError => "local-error",
            Self::LowBattery => "low-battery",
            Self::WeakDevice => "weak-device",
            Self::NoGpu => "no-gpu",
            Self::OfflineFallback => "offline-fallback",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RouteDecision / RouteContext / RouteEvent
// ============================================================================

/// Which backend serves a request, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub chosen: Provider,
    pub reason: RouteReason,
    pub stats: DeviceStats,
}

impl RouteDecision {
    /// Context handed to the backend for the given attempt.
    pub fn context(&self, attempt: u32) -> RouteContext {
        RouteContext {
            reason: self.reason,
            stats: self.stats.clone(),
            attempt,
        }
    }
}

/// Routing context visible to cloud functions. `attempt` is 1 for the
/// routed attempt and 2 for the fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteContext {
    pub reason: RouteReason,
    pub stats: DeviceStats,
    pub attempt: u32,
}

/// Emitted once per attempt, before the backend is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub chosen: Provider,
    pub reason: RouteReason,
    pub attempt: u32,
}

/// Callback observing every routing decision.
pub type RouteObserver = Arc<dyn Fn(&RouteEvent) + Send + Sync>;

// ============================================================================
// decide_route
// ============================================================================

/// First local disqualifier in priority order, if any.
pub fn local_disqualifier(stats: &DeviceStats) -> Option<RouteReason> {
    if !stats.gpu_present {
        return Some(RouteReason::NoGpu);
    }
    if stats.grade == Grade::C {
        return Some(RouteReason::WeakDevice);
    }
    if let Some(level) = stats.battery_level {
        if stats.battery_charging == Some(false) && level < LOW_BATTERY_THRESHOLD {
            return Some(RouteReason::LowBattery);
        }
    }
    None
}

/// Pick a backend for one request.
pub fn decide_route(
    local: Option<&dyn InferenceBackend>,
    cloud: Option<&dyn InferenceBackend>,
    stats: &DeviceStats,
    force: Option<Provider>,
    online: bool,
) -> InferenceResult<RouteDecision> {
    let decision = |chosen, reason| RouteDecision {
        chosen,
        reason,
        stats: stats.clone(),
    };

    if let Some(forced) = force {
        let present = match forced {
            Provider::Local => local.is_some(),
            Provider::Cloud => cloud.is_some(),
        };
        if !present {
            return Err(InferenceError::no_provider(format!(
                "Forced provider '{}' is not configured ({})",
                forced,
                RouteReason::LocalUnavailable
            )));
        }
        return Ok(decision(forced, RouteReason::LocalUnavailable));
    }

    let local = match (local, cloud) {
        (Some(local), Some(_)) => local,
        (Some(_), None) => return Ok(decision(Provider::Local, RouteReason::LocalUnavailable)),
        (None, Some(_)) => return Ok(decision(Provider::Cloud, RouteReason::LocalUnavailable)),
        (None, None) => {
            return Err(InferenceError::no_provider(
                "No local or cloud provider is configured",
            ));
        }
    };

    if let Some(reason) = local_disqualifier(stats) {
        if !online {
            return Ok(decision(Provider::Local, RouteReason::OfflineFallback));
        }
        return Ok(decision(Provider::Cloud, reason));
    }

    if local.is_ready() {
        Ok(decision(Provider::Local, RouteReason::LocalUnavailable))
    } else {
        Ok(decision(Provider::Cloud, RouteReason::LocalLoading))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::error::ErrorCode;
    use crate::orchestrator::types::{ChatCompletion, ChatCompletionRequest, ChunkStream};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct StubBackend {
        ready: bool,
    }

    #[async_trait]
    impl InferenceBackend for StubBackend {
        fn name(&self) -> &str {
            "stub"
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn initialize(&self, _stats: &DeviceStats) -> InferenceResult<()> {
            Ok(())
        }

        async fn complete(
            &self,
            _request: &ChatCompletionRequest,
            _cancel: CancellationToken,
        ) -> InferenceResult<ChatCompletion> {
            Err(InferenceError::inference_failed("stub"))
        }

        async fn stream(
            &self,
            _request: &ChatCompletionRequest,
            _cancel: CancellationToken,
        ) -> InferenceResult<ChunkStream> {
            Err(InferenceError::inference_failed("stub"))
        }

        async fn dispose(&self) {}
    }

    fn stats(vram: u64, battery: Option<(f64, bool)>) -> DeviceStats {
        DeviceStats {
            gpu_present: vram > 0,
            vram_estimate_mb: vram,
            grade: crate::orchestrator::telemetry::grade(vram),
            battery_level: battery.map(|b| b.0),
            battery_charging: battery.map(|b| b.1),
            system_memory_gb: 16.0,
        }
    }

    const READY: StubBackend = StubBackend { ready: true };
    const LOADING: StubBackend = StubBackend { ready: false };

    #[test]
    fn test_strong_device_routes_local() {
        let decision = decide_route(
            Some(&READY),
            Some(&READY),
            &stats(8192, Some((0.8, true))),
            None,
            true,
        )
        .unwrap();
        assert_eq!(decision.chosen, Provider::Local);
        assert_eq!(decision.stats.grade, Grade::S);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let input = stats(4096, Some((0.5, false)));
        let a = decide_route(Some(&READY), Some(&READY), &input, None, true).unwrap();
        let b = decide_route(Some(&READY), Some(&READY), &input, None, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_weak_device_goes_cloud_regardless_of_readiness() {
        // GPU present but below 2 GiB.
        let mut weak = stats(1024, None);
        weak.gpu_present = true;
        for local in [&READY, &LOADING] {
            let decision = decide_route(Some(local), Some(&READY), &weak, None, true).unwrap();
            assert_eq!(decision.chosen, Provider::Cloud);
            assert_eq!(decision.reason, RouteReason::WeakDevice);
        }
    }

    #[test]
    fn test_no_gpu_checked_before_grade() {
        let decision =
            decide_route(Some(&READY), Some(&READY), &stats(0, None), None, true).unwrap();
        assert_eq!(decision.reason, RouteReason::NoGpu);
    }

    #[test]
    fn test_low_battery_only_when_unplugged() {
        let unplugged = stats(8192, Some((0.10, false)));
        let decision = decide_route(Some(&READY), Some(&READY), &unplugged, None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Cloud);
        assert_eq!(decision.reason, RouteReason::LowBattery);

        let charging = stats(8192, Some((0.10, true)));
        let decision = decide_route(Some(&READY), Some(&READY), &charging, None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Local);

        let boundary = stats(8192, Some((LOW_BATTERY_THRESHOLD, false)));
        let decision = decide_route(Some(&READY), Some(&READY), &boundary, None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Local);
    }

    #[test]
    fn test_offline_disqualified_falls_back_local() {
        let decision =
            decide_route(Some(&LOADING), Some(&READY), &stats(0, None), None, false).unwrap();
        assert_eq!(decision.chosen, Provider::Local);
        assert_eq!(decision.reason, RouteReason::OfflineFallback);
    }

    #[test]
    fn test_loading_local_routes_cloud() {
        let decision =
            decide_route(Some(&LOADING), Some(&READY), &stats(8192, None), None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Cloud);
        assert_eq!(decision.reason, RouteReason::LocalLoading);
    }

    #[test]
    fn test_single_backend_routes_unconditionally() {
        let decision = decide_route(Some(&LOADING), None, &stats(0, None), None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Local);

        let decision = decide_route(None, Some(&LOADING), &stats(8192, None), None, true).unwrap();
        assert_eq!(decision.chosen, Provider::Cloud);
    }

    #[test]
    fn test_neither_configured_is_no_provider() {
        let err = decide_route(None, None, &stats(8192, None), None, true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[test]
    fn test_forced_route_ignores_readiness_and_capability() {
        let decision = decide_route(
            Some(&LOADING),
            Some(&READY),
            &stats(0, Some((0.01, false))),
            Some(Provider::Local),
            true,
        )
        .unwrap();
        assert_eq!(decision.chosen, Provider::Local);

        let decision = decide_route(
            Some(&READY),
            Some(&READY),
            &stats(8192, None),
            Some(Provider::Cloud),
            true,
        )
        .unwrap();
        assert_eq!(decision.chosen, Provider::Cloud);
    }

    #[test]
    fn test_forced_missing_backend_uses_generic_reason() {
        let err = decide_route(None, Some(&READY), &stats(8192, None), Some(Provider::Local), true)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
        assert!(err.message().contains("local-unavailable"));

        // A missing cloud side reports the same generic reason.
        let err = decide_route(Some(&READY), None, &stats(8192, None), Some(Provider::Cloud), true)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
        assert!(err.message().contains("local-unavailable"));
    }

    #[test]
    fn test_context_carries_attempt() {
        let decision =
            decide_route(Some(&READY), Some(&READY), &stats(8192, None), None, true).unwrap();
        let ctx = decision.context(2);
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.reason, decision.reason);
        assert_eq!(
            serde_json::to_value(RouteReason::OfflineFallback).unwrap(),
            "offline-fallback"
        );
    }
}
