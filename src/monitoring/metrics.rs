// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use axum::{routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Prometheus registration failure.
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Known peers gauge.
    pub peers: IntGauge,
    /// Established sessions gauge.
    pub sessions_established: IntGauge,
    /// Store-and-forward queue depth gauge.
    pub store_forward_depth: IntGauge,
    /// Router outbox depth gauge.
    pub outbox_depth: IntGauge,

    /// Packets dropped at the framing layer.
    pub wire_drop_total: IntCounter,
    /// Packets dropped on signature failure.
    pub signature_drop_total: IntCounter,
    /// Packets dropped by the replay window.
    pub replay_drop_total: IntCounter,
    /// Packets dropped as duplicates.
    pub dedup_drop_total: IntCounter,
    /// Packets dropped by the per-sender rate gate.
    pub rate_limited_total: IntCounter,

    /// Packets flooded onward.
    pub relay_flood_total: IntCounter,
    /// Packets forwarded along a source route.
    pub relay_routed_total: IntCounter,
    /// Sum of hops observed on ingressed packets (loop telemetry).
    pub relay_hops_total: IntCounter,

    /// Announces broadcast.
    pub announces_total: IntCounter,
    /// Fragment sets expired before completion.
    pub fragments_expired_total: IntCounter,
    /// Private messages handed to a transport.
    pub private_sent_total: IntCounter,
    /// Private messages surfaced to the UI.
    pub private_received_total: IntCounter,
}

macro_rules! register {
    ($registry:expr, $metric:expr) => {
        $registry
            .register(Box::new($metric.clone()))
            .map_err(|_| MetricsError::Prom)?;
    };
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers =
            IntGauge::new("embermesh_peers", "Known peers").map_err(|_| MetricsError::Prom)?;
        let sessions_established =
            IntGauge::new("embermesh_sessions_established", "Established noise sessions")
                .map_err(|_| MetricsError::Prom)?;
        let store_forward_depth = IntGauge::new(
            "embermesh_store_forward_depth",
            "Messages cached for offline favorites",
        )
        .map_err(|_| MetricsError::Prom)?;
        let outbox_depth =
            IntGauge::new("embermesh_outbox_depth", "Parked private sends")
                .map_err(|_| MetricsError::Prom)?;

        let wire_drop_total =
            IntCounter::new("embermesh_wire_drop_total", "Undecodable packets dropped")
                .map_err(|_| MetricsError::Prom)?;
        let signature_drop_total = IntCounter::new(
            "embermesh_signature_drop_total",
            "Packets dropped on bad or missing signatures",
        )
        .map_err(|_| MetricsError::Prom)?;
        let replay_drop_total = IntCounter::new(
            "embermesh_replay_drop_total",
            "Packets outside the replay window",
        )
        .map_err(|_| MetricsError::Prom)?;
        let dedup_drop_total =
            IntCounter::new("embermesh_dedup_drop_total", "Duplicate packets dropped")
                .map_err(|_| MetricsError::Prom)?;
        let rate_limited_total =
            IntCounter::new("embermesh_rate_limited_total", "Rate-limited packets")
                .map_err(|_| MetricsError::Prom)?;

        let relay_flood_total =
            IntCounter::new("embermesh_relay_flood_total", "Packets flooded onward")
                .map_err(|_| MetricsError::Prom)?;
        let relay_routed_total = IntCounter::new(
            "embermesh_relay_routed_total",
            "Packets forwarded along a source route",
        )
        .map_err(|_| MetricsError::Prom)?;
        let relay_hops_total = IntCounter::new(
            "embermesh_relay_hops_total",
            "Cumulative hops observed on ingress",
        )
        .map_err(|_| MetricsError::Prom)?;

        let announces_total =
            IntCounter::new("embermesh_announces_total", "Identity announces sent")
                .map_err(|_| MetricsError::Prom)?;
        let fragments_expired_total = IntCounter::new(
            "embermesh_fragments_expired_total",
            "Fragment sets expired before completion",
        )
        .map_err(|_| MetricsError::Prom)?;
        let private_sent_total = IntCounter::new(
            "embermesh_private_sent_total",
            "Private messages handed to a transport",
        )
        .map_err(|_| MetricsError::Prom)?;
        let private_received_total = IntCounter::new(
            "embermesh_private_received_total",
            "Private messages surfaced locally",
        )
        .map_err(|_| MetricsError::Prom)?;

        register!(registry, peers);
        register!(registry, sessions_established);
        register!(registry, store_forward_depth);
        register!(registry, outbox_depth);
        register!(registry, wire_drop_total);
        register!(registry, signature_drop_total);
        register!(registry, replay_drop_total);
        register!(registry, dedup_drop_total);
        register!(registry, rate_limited_total);
        register!(registry, relay_flood_total);
        register!(registry, relay_routed_total);
        register!(registry, relay_hops_total);
        register!(registry, announces_total);
        register!(registry, fragments_expired_total);
        register!(registry, private_sent_total);
        register!(registry, private_received_total);

        Ok(Self {
            registry,
            peers,
            sessions_established,
            store_forward_depth,
            outbox_depth,
            wire_drop_total,
            signature_drop_total,
            replay_drop_total,
            dedup_drop_total,
            rate_limited_total,
            relay_flood_total,
            relay_routed_total,
            relay_hops_total,
            announces_total,
            fragments_expired_total,
            private_sent_total,
            private_received_total,
        })
    }
}

async fn render(metrics: Arc<Metrics>) -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder
        .encode(&metrics.registry.gather(), &mut buf)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Serve `/metrics` and `/healthz` on `addr` until the task is aborted.
pub fn spawn_exporter(addr: String, metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route(
                "/metrics",
                get({
                    let metrics = metrics.clone();
                    move || render(metrics.clone())
                }),
            )
            .route("/healthz", get(|| async { "ok" }));

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(%addr, err = %e, "metrics exporter bind failed");
                return;
            }
        };
        info!(%addr, "metrics exporter listening");
        if let Err(e) = axum::serve(listener, app).await {
            warn!(err = %e, "metrics exporter stopped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let m = Metrics::new().expect("metrics");
        m.peers.set(3);
        m.dedup_drop_total.inc();
        let families = m.registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "embermesh_peers"));
    }
}
