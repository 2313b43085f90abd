//! Daemon-facing tool service (spec.md §4.11).
//!
//! Grounded on the teacher's `NodeContext`-mediated dispatch style for the
//! "validate, then act" shape of each operation; the operation list itself
//! has no teacher counterpart and is modeled directly from spec.md §4.11.

use std::sync::Arc;
use thiserror::Error;

use crate::events::{Event, EventEmitter, EventKind};
use crate::tools::adapters::{self, pool::HttpClientPool, pool::McpClientPool, Adapter, InvokeContext, ToolInvokeRequest};
use crate::tools::manifest::{validate_manifest_json, validate_type_system, Diagnostic, Manifest, Severity};
use crate::tools::overlay::{merge_overlay, Overlay};
use crate::tools::registry::{Store, StoreError, ToolRegistration, ToolStatus};
use crate::secret::SecretKey;
use rustc_hash::FxHashMap;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<Diagnostic>),
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("tool '{0}' is disabled")]
    Disabled(String),
    #[error("operation only applies to mcp-origin tools")]
    McpOnly,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] adapters::ToolError),
}

pub struct TestActionResult {
    pub success: bool,
    pub outputs: crate::envelope::Value,
    pub duration_ms: u64,
    pub metadata: FxHashMap<String, crate::envelope::Value>,
}

/// Orchestrates register/update/delete/test/health operations over a
/// [`Store`], re-validating on every mutation (spec.md §4.11).
pub struct ToolService {
    pub(crate) store: Arc<dyn Store>,
    http_pool: Arc<HttpClientPool>,
    mcp_pool: Arc<McpClientPool>,
    native_registry: Arc<adapters::native::NativeToolRegistry>,
    secret_key: SecretKey,
    emitter: Arc<dyn EventEmitter>,
}

impl ToolService {
    pub fn new(
        store: Arc<dyn Store>,
        http_pool: Arc<HttpClientPool>,
        mcp_pool: Arc<McpClientPool>,
        native_registry: Arc<adapters::native::NativeToolRegistry>,
        secret_key: SecretKey,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            store,
            http_pool,
            mcp_pool,
            native_registry,
            secret_key,
            emitter,
        }
    }

    pub async fn list(&self) -> Result<Vec<ToolRegistration>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<ToolRegistration, ServiceError> {
        self.store.get(name).await?.ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Runs the shared validation pipeline (spec.md §4.11): manifest schema
    /// + type system, name-uniqueness against existing registrations
    /// (skipping the registration's own prior entry on update), and
    /// config completeness against declared required fields.
    async fn validate(&self, registration: &ToolRegistration, is_update: bool) -> Result<(), ServiceError> {
        let mut diags = validate_manifest_json(&registration.manifest);
        diags.extend(validate_type_system(&registration.manifest.config));

        if !is_update {
            if self.store.get(&registration.name).await?.is_some() {
                diags.push(Diagnostic {
                    field: "name".to_string(),
                    code: "DUPLICATE_NAME".to_string(),
                    severity: Severity::Error,
                    message: format!("a tool named '{}' is already registered", registration.name),
                });
            }
        }

        for (field_name, spec) in &registration.manifest.config {
            if spec.required && !registration.config.contains_key(field_name) {
                diags.push(Diagnostic {
                    field: format!("config.{field_name}"),
                    code: "MISSING_CONFIG".to_string(),
                    severity: Severity::Error,
                    message: format!("required config field '{field_name}' is not set"),
                });
            }
        }

        if diags.iter().any(|d| d.severity == Severity::Error) {
            return Err(ServiceError::Validation(diags));
        }
        Ok(())
    }

    pub async fn register(&self, mut registration: ToolRegistration) -> Result<ToolRegistration, ServiceError> {
        self.validate(&registration, false).await?;
        registration.encrypt_sensitive(&self.secret_key)?;
        self.store.put(registration.clone()).await?;
        Ok(registration)
    }

    pub async fn update(&self, mut registration: ToolRegistration) -> Result<ToolRegistration, ServiceError> {
        self.validate(&registration, true).await?;
        registration.encrypt_sensitive(&self.secret_key)?;
        self.store.put(registration.clone()).await?;
        Ok(registration)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        Ok(self.store.delete(name).await?)
    }

    pub async fn update_config(&self, name: &str, config: FxHashMap<String, String>) -> Result<ToolRegistration, ServiceError> {
        let mut registration = self.get(name).await?;
        registration = registration.decrypted(&self.secret_key)?;
        registration.config = config;
        self.update(registration).await
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<ToolRegistration, ServiceError> {
        let mut registration = self.get(name).await?;
        registration.enabled = enabled;
        if !enabled {
            registration.status = ToolStatus::Disabled;
        }
        self.store.put(registration.clone()).await?;
        Ok(registration)
    }

    /// MCP-only: re-parses the manifest's overlay and re-merges it (spec.md
    /// §4.11 `UpdateOverlay`).
    pub async fn update_overlay(&self, name: &str, overlay: Overlay) -> Result<ToolRegistration, ServiceError> {
        let mut registration = self.get(name).await?;
        if registration.origin != "mcp" {
            return Err(ServiceError::McpOnly);
        }
        let (merged_manifest, diags) = merge_overlay(&registration.manifest, &overlay);
        if diags.iter().any(|d| d.severity == Severity::Error) {
            return Err(ServiceError::Validation(diags));
        }
        registration.manifest = merged_manifest;
        registration.overlay = registration.overlay.clone();
        self.validate(&registration, true).await?;
        self.store.put(registration.clone()).await?;
        Ok(registration)
    }

    /// Re-fetches an MCP tool's own advertised schema and re-merges its
    /// overlay (spec.md §4.11 `Refresh`, MCP only). The actual `tools/list`
    /// round-trip is the MCP adapter's concern; this orchestrates the
    /// validate-and-persist half of the operation given a freshly-fetched
    /// manifest.
    pub async fn refresh(&self, name: &str, fetched_manifest: Manifest) -> Result<ToolRegistration, ServiceError> {
        let mut registration = self.get(name).await?;
        if registration.origin != "mcp" {
            return Err(ServiceError::McpOnly);
        }
        registration.manifest = fetched_manifest;
        self.validate(&registration, true).await?;
        self.store.put(registration.clone()).await?;
        Ok(registration)
    }

    /// Requires the tool be enabled, resolves the adapter via the factory,
    /// and invokes it with the stored (decrypted) config (spec.md §4.11
    /// `TestAction`).
    pub async fn test_action(&self, name: &str, action: &str, inputs: crate::envelope::Value, request_id: String) -> Result<TestActionResult, ServiceError> {
        let registration = self.get(name).await?;
        if !registration.enabled || registration.status == ToolStatus::Disabled {
            return Err(ServiceError::Disabled(name.to_string()));
        }
        let registration = registration.decrypted(&self.secret_key)?;
        let node_id = crate::node::NodeKind::new(registration.name.clone());

        let adapter = adapters::build_adapter(Some(&registration.origin), &registration.manifest, &self.http_pool, &self.mcp_pool, &self.native_registry)?;
        let ctx = InvokeContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            request_id: request_id.clone(),
        };
        let _ = self.emitter.emit(Event::new(EventKind::ToolCall, request_id.clone(), &node_id, action.to_string()));
        let req = ToolInvokeRequest {
            tool_name: registration.name.clone(),
            action: action.to_string(),
            inputs,
            config: registration.config.clone(),
            request_id: request_id.clone(),
            transport: registration.origin.clone(),
            tool_origin: registration.origin.clone(),
        };
        let result = adapter.invoke(&ctx, req).await;
        match result {
            Ok(response) => {
                let event = Event::new(EventKind::ToolResult, request_id, &node_id, action.to_string())
                    .with_payload("outputs", response.outputs.clone());
                let _ = self.emitter.emit(event);
                Ok(TestActionResult {
                    success: true,
                    outputs: response.outputs,
                    duration_ms: response.duration_ms,
                    metadata: response.metadata,
                })
            }
            Err(err) => Err(ServiceError::Adapter(err)),
        }
    }

    /// `Health` dispatch (spec.md §4.11): disabled tools never probe;
    /// non-MCP tools are always `ready`; MCP tools run the overlay-selected
    /// strategy via the supplied probe closure and track consecutive
    /// failures against the manifest's threshold. The probe itself (an
    /// actual MCP `ping`/connection check) is supplied by the caller so
    /// this method stays transport-agnostic and unit-testable.
    pub async fn health<F, Fut>(&self, name: &str, probe: F) -> Result<ToolRegistration, ServiceError>
    where
        F: FnOnce(&ToolRegistration) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut registration = self.get(name).await?;
        let previous_status = registration.status;

        if !registration.enabled {
            registration.status = ToolStatus::Disabled;
        } else if registration.origin != "mcp" {
            registration.status = ToolStatus::Ready;
            registration.health_failures = 0;
        } else {
            let healthy = probe(&registration).await;
            let threshold = registration.manifest.health.as_ref().map(|h| h.unhealthy_threshold).unwrap_or(1);
            if healthy {
                registration.health_failures = 0;
                registration.status = ToolStatus::Ready;
            } else {
                registration.health_failures += 1;
                registration.status = if registration.health_failures >= threshold {
                    ToolStatus::Unhealthy
                } else {
                    ToolStatus::Unverified
                };
            }
        }
        registration.last_health_check = Some(chrono::Utc::now());

        if registration.status != previous_status {
            let node_id = crate::node::NodeKind::new(registration.name.clone());
            let event = Event::new(EventKind::NodeOutputFinal, "health".to_string(), &node_id, "health_check")
                .with_payload("transition", crate::envelope::Value::String(format!("{previous_status:?} -> {:?}", registration.status)));
            let _ = self.emitter.emit(event);
        }

        self.store.put(registration.clone()).await?;
        Ok(registration)
    }
}
