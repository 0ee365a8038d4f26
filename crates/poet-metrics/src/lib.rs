// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-round Prometheus metrics.
//!
//! Mirrors `original_source/service/round.go`'s `roundMetricCollector`:
//! one gauge, one label (`epoch`), registered when a round is created and
//! unregistered on teardown. Registration failure is logged and ignored —
//! the one error this crate is allowed to swallow, per the round engine's
//! error-handling policy (a metrics outage must never corrupt a round).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, Opts, Registry};

/// Collector for a single round's member count. Reads a shared counter
/// rather than owning its own state, so it always reports what `Round`
/// itself believes `members` to be.
pub struct RoundMetrics {
    members: Arc<AtomicU64>,
    gauge: Gauge,
}

impl RoundMetrics {
    pub fn new(epoch: u32, members: Arc<AtomicU64>) -> Self {
        let opts = Opts::new("round_members_total", "the total number of members in a round")
            .namespace("poet")
            .const_label("epoch", epoch.to_string());
        let gauge = Gauge::with_opts(opts).expect("static metric description is well-formed");
        RoundMetrics { members, gauge }
    }

    /// Registers `self` with `registry`, logging and swallowing any
    /// failure (a pre-existing collector for the same epoch, most
    /// commonly, if a round is recreated before its predecessor's
    /// teardown finished unregistering).
    pub fn register(self, registry: &Registry) -> Option<RegisteredRoundMetrics> {
        let gauge = self.gauge.clone();
        match registry.register(Box::new(self)) {
            Ok(()) => Some(RegisteredRoundMetrics {
                registry: registry.clone(),
                gauge,
            }),
            Err(err) => {
                tracing::error!(error = %err, "failed to register round metric");
                None
            }
        }
    }
}

impl Collector for RoundMetrics {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauge.set(self.members.load(Ordering::Relaxed) as f64);
        self.gauge.collect()
    }
}

/// A registration handle returned by [`RoundMetrics::register`]. Dropping
/// it does not unregister anything — unregistration happens explicitly
/// via [`RegisteredRoundMetrics::unregister`] from `Round::teardown`, so
/// a failure there is logged rather than silently swallowed by `Drop`.
pub struct RegisteredRoundMetrics {
    registry: Registry,
    gauge: Gauge,
}

impl RegisteredRoundMetrics {
    pub fn unregister(self) {
        if let Err(err) = self.registry.unregister(Box::new(GaugeCollector(self.gauge))) {
            tracing::error!(error = %err, "failed to unregister round metric");
        }
    }
}

/// `Gauge` already implements `Collector`, but the registry identifies a
/// collector by the `Box<dyn Collector>` fingerprint it was registered
/// under, which was a `RoundMetrics`, not a bare `Gauge`. Wrapping it in
/// the same outer shape the registry saw lets `unregister` find the
/// match by descriptor rather than by concrete type.
struct GaugeCollector(Gauge);

impl Collector for GaugeCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}
