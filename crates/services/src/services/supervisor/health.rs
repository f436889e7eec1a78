//! Periodic HTTP health probing for services that declare a probe.
//!
//! Probes are serialized per service by construction: one monitor task,
//! one in-flight request. A single failed probe parks the instance in
//! `unhealthy`; a success recovers it; a second consecutive failure
//! triggers a supervised stop-and-restart within the restart policy.

use std::{sync::Arc, time::Duration};

use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use super::{Inner, Instance, ProcessState, config::HealthProbe, events::ProcessEvent};

/// Budget for a single probe request.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures that trigger a restart.
const FAILURE_THRESHOLD: u32 = 2;

pub(super) fn spawn_health_monitor(
    inner: Arc<Inner>,
    instance: Arc<Instance>,
    probe: HealthProbe,
    port: u16,
) {
    tokio::spawn(async move {
        let name = instance.config.name.clone();
        let url = format!("http://127.0.0.1:{}{}", port, probe.path);
        let client = reqwest::Client::new();

        let mut ticker = interval(probe.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; services get one full
        // interval before their first probe.
        ticker.tick().await;

        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = instance.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !matches!(
                instance.state(),
                ProcessState::Running | ProcessState::Unhealthy
            ) {
                break;
            }

            let healthy = match client
                .get(&url)
                .timeout(PROBE_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            };

            if healthy {
                if instance.state() == ProcessState::Unhealthy {
                    info!(service = %name, "Health probe recovered");
                    instance.set_state(ProcessState::Running);
                }
                consecutive_failures = 0;
                continue;
            }

            consecutive_failures += 1;
            warn!(
                service = %name,
                consecutive_failures,
                url = %url,
                "Health probe failed"
            );
            if consecutive_failures == 1 {
                instance.set_state(ProcessState::Unhealthy);
            }
            if consecutive_failures >= FAILURE_THRESHOLD {
                inner.emit(ProcessEvent::ProcessUnhealthy { name: name.clone() });
                // The exit watcher sees the restart request and routes
                // the kill through the crash path, policy included.
                instance.request_restart();
                break;
            }
        }
    });
}
