//! Background health scheduler (spec.md §4.12).
//!
//! Grounded on the teacher's cancellation-aware background-loop shape
//! (spawn a task selecting on a `CancellationToken` each tick); the
//! per-registration due-check and event-emission logic is modeled
//! directly from spec.md §4.12 since the teacher has no scheduler.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventEmitter, EventKind};
use crate::node::NodeKind;
use crate::tools::registry::{ToolRegistration, ToolStatus};
use crate::tools::service::ToolService;

const DEFAULT_INTERVAL_SECONDS: u64 = 30;

/// Emitted once per health evaluation (spec.md §4.12).
#[derive(Clone, Debug)]
pub struct HealthEvent {
    pub tool_name: String,
    pub previous_status: ToolStatus,
    pub status: ToolStatus,
    pub error: Option<String>,
}

fn interval_for(reg: &ToolRegistration) -> Duration {
    let seconds = reg.manifest.health.as_ref().map(|h| h.interval_seconds).unwrap_or(DEFAULT_INTERVAL_SECONDS);
    Duration::from_secs(seconds.max(1))
}

fn is_due(reg: &ToolRegistration, now: chrono::DateTime<Utc>) -> bool {
    match reg.last_health_check {
        None => true,
        Some(last) => {
            let interval = chrono::Duration::from_std(interval_for(reg)).unwrap_or(chrono::Duration::seconds(DEFAULT_INTERVAL_SECONDS as i64));
            now >= last + interval
        }
    }
}

/// Walks the registry's tools once, health-checking those that are due
/// (spec.md §4.12 `RunOnce`). `probe` decides MCP liveness given a
/// registration; non-MCP/disabled tools never invoke it (see
/// [`ToolService::health`]).
pub async fn run_once<F, Fut>(service: &ToolService, probe: F, on_event: &dyn Fn(HealthEvent)) -> Result<(), crate::tools::service::ServiceError>
where
    F: Fn(&ToolRegistration) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let now = Utc::now();
    for reg in service.list().await? {
        if reg.origin == "native" && reg.manifest.transport.transport_type == crate::tools::manifest::TransportType::Native {
            // Builtin/native tools never need scheduled health checks.
            continue;
        }
        if !reg.enabled || !is_due(&reg, now) {
            continue;
        }
        let previous_status = reg.status;
        let updated = service.health(&reg.name, |r| probe(r)).await?;
        on_event(HealthEvent {
            tool_name: updated.name.clone(),
            previous_status,
            status: updated.status,
            error: None,
        });
    }
    Ok(())
}

/// Background scheduler handle (spec.md §4.12 `Start`/`Stop`).
pub struct HealthScheduler {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HealthScheduler {
    /// Spawns a loop that calls [`run_once`] every `tick` until cancelled.
    /// Uses `tokio::select!` against the cancellation token so `stop`
    /// returns promptly rather than waiting out a full tick.
    pub fn start<F, Fut>(service: Arc<ToolService>, tick: Duration, probe: F, emitter: Arc<dyn EventEmitter>) -> Self
    where
        F: Fn(&ToolRegistration) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                let emitter = emitter.clone();
                let result = run_once(&service, &probe, &|health_event: HealthEvent| {
                    let node_id = NodeKind::new(health_event.tool_name.clone());
                    let event = Event::new(EventKind::NodeOutputFinal, "health-scheduler".to_string(), &node_id, "health_tick");
                    let _ = emitter.emit(event);
                })
                .await;
                if result.is_err() {
                    tracing::warn!(error = ?result.err(), "health scheduler tick failed");
                }
            }
        });
        Self { cancel, handle: Some(handle) }
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretKey;
    use crate::tools::adapters::pool::{HttpClientPool, McpClientPool};
    use crate::tools::manifest::{RetryPolicy, ToolMetadata, Transport, TransportType, MANIFEST_SCHEMA_ID, MANIFEST_VERSION};
    use crate::tools::registry::InMemoryToolStore;
    use crate::events::MemoryEmitter;
    use rustc_hash::FxHashMap;

    fn mcp_manifest(name: &str) -> crate::tools::manifest::Manifest {
        crate::tools::manifest::Manifest {
            schema: MANIFEST_SCHEMA_ID.to_string(),
            manifest_version: MANIFEST_VERSION.to_string(),
            tool: ToolMetadata {
                name: name.to_string(),
                description: "demo".into(),
                version: "1.0.0".into(),
                author: None,
                homepage: None,
                tags: vec![],
            },
            transport: Transport {
                transport_type: TransportType::Mcp,
                endpoint: None,
                command: Some("mcp-server".into()),
                args: vec![],
                env: FxHashMap::default(),
                mode: None,
                timeout_ms: 5_000,
                retry: RetryPolicy::default(),
            },
            actions: FxHashMap::default(),
            config: FxHashMap::default(),
            health: None,
        }
    }

    #[tokio::test]
    async fn run_once_checks_only_due_tools() {
        let service = ToolService::new(
            InMemoryToolStore::new(),
            HttpClientPool::new(),
            McpClientPool::new(4),
            crate::tools::adapters::native::NativeToolRegistry::new(),
            SecretKey::host_derived(),
            MemoryEmitter::new(),
        );
        let reg = ToolRegistration::new("mcp_tool", "mcp", mcp_manifest("mcp_tool"));
        service.register(reg).await.unwrap();

        let events = parking_lot::Mutex::new(Vec::new());
        run_once(&service, |_| async { true }, &|e: HealthEvent| events.lock().push(e)).await.unwrap();
        assert_eq!(events.lock().len(), 1);
        assert_eq!(events.lock()[0].status, ToolStatus::Ready);

        // Not due yet on a second immediate run.
        let events2 = parking_lot::Mutex::new(Vec::new());
        run_once(&service, |_| async { true }, &|e: HealthEvent| events2.lock().push(e)).await.unwrap();
        assert!(events2.lock().is_empty());
    }
}
