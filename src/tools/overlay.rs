//! Tool overlay parsing and merge (spec.md §4.9, §6).
//!
//! Grounded on `weavegraph::utils::json_ext::deep_merge` for the general
//! "apply operations in order, accumulate diagnostics" shape; the overlay
//! schema itself is modeled directly from spec.md §4.9/§6 since the
//! teacher has no overlay concept.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::tools::manifest::{Diagnostic, FieldSpec, HealthStrategy, Manifest, Severity};

pub const OVERLAY_VERSION: &str = "1.0";

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Overlay {
    pub overlay_version: String,
    #[serde(default)]
    pub group_actions: FxHashMap<String, String>,
    #[serde(default)]
    pub description_overrides: FxHashMap<String, String>,
    #[serde(default)]
    pub input_overrides: FxHashMap<String, FxHashMap<String, FieldSpec>>,
    #[serde(default)]
    pub output_schemas: FxHashMap<String, FxHashMap<String, FieldSpec>>,
    #[serde(default)]
    pub action_modes: FxHashMap<String, ActionMode>,
    #[serde(default)]
    pub config: FxHashMap<String, FieldSpec>,
    #[serde(default)]
    pub metadata: OverlayMetadata,
    #[serde(default)]
    pub health: Option<OverlayHealth>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    LlmCallable,
    Standalone,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OverlayMetadata {
    pub author: Option<String>,
    pub version: Option<String>,
    pub homepage: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayHealth {
    pub strategy: Option<HealthStrategy>,
    pub endpoint: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub unhealthy_threshold: Option<u32>,
}

/// Parses an overlay YAML document (spec.md §6).
pub fn parse_overlay(yaml: &str) -> Result<Overlay, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}

/// Applies an overlay's operations in order (spec.md §4.9) and returns the
/// merged manifest plus every diagnostic produced along the way (merged
/// with the resulting manifest's type-system diagnostics by the caller,
/// sorted by field then code).
pub fn merge_overlay(base: &Manifest, overlay: &Overlay) -> (Manifest, Vec<Diagnostic>) {
    let mut manifest = base.clone();
    let mut diags = Vec::new();

    // Step 1: ensure every action has mcp_tool_name, defaulting to the
    // action key.
    for (key, action) in manifest.actions.iter_mut() {
        if action.mcp_tool_name.is_none() {
            action.mcp_tool_name = Some(key.clone());
        }
    }

    // Step 2: group_actions — alias -> original MCP tool name.
    for (alias, mcp_tool_name) in &overlay.group_actions {
        let target = manifest
            .actions
            .values()
            .find(|a| a.mcp_tool_name.as_deref() == Some(mcp_tool_name.as_str()));
        match target {
            Some(existing) => {
                let mut aliased = existing.clone();
                aliased.mcp_tool_name = Some(mcp_tool_name.clone());
                manifest.actions.insert(alias.clone(), aliased);
            }
            None => diags.push(Diagnostic {
                field: format!("group_actions.{alias}"),
                code: "UNKNOWN_MCP_TOOL".to_string(),
                severity: Severity::Error,
                message: format!("alias '{alias}' points at unknown MCP tool '{mcp_tool_name}'"),
            }),
        }
    }

    // Step 3: description/input/output overrides.
    for (action_name, description) in &overlay.description_overrides {
        if let Some(action) = manifest.actions.get_mut(action_name) {
            action.description = description.clone();
        }
    }
    for (action_name, inputs) in &overlay.input_overrides {
        if let Some(action) = manifest.actions.get_mut(action_name) {
            action.inputs.extend(inputs.clone());
        }
    }
    for (action_name, outputs) in &overlay.output_schemas {
        if let Some(action) = manifest.actions.get_mut(action_name) {
            action.outputs.extend(outputs.clone());
        }
    }

    // Step 4: action_modes -> llm_callable.
    for (action_name, mode) in &overlay.action_modes {
        if let Some(action) = manifest.actions.get_mut(action_name) {
            action.llm_callable = matches!(mode, ActionMode::LlmCallable);
        }
    }

    // Step 5: config, with optional env_var mapping.
    manifest.config.extend(overlay.config.clone());

    // Step 6: metadata overrides.
    if let Some(author) = &overlay.metadata.author {
        manifest.tool.author = Some(author.clone());
    }
    if let Some(version) = &overlay.metadata.version {
        manifest.tool.version = version.clone();
    }
    if let Some(homepage) = &overlay.metadata.homepage {
        manifest.tool.homepage = Some(homepage.clone());
    }
    if !overlay.metadata.tags.is_empty() {
        manifest.tool.tags = overlay.metadata.tags.clone();
    }

    // Step 7: health overrides.
    if let Some(health_overlay) = &overlay.health {
        let mut health = manifest.health.take().unwrap_or(crate::tools::manifest::HealthSpec {
            strategy: None,
            endpoint: None,
            method: "GET".to_string(),
            interval_seconds: 30,
            timeout_ms: 5_000,
            unhealthy_threshold: 1,
        });
        if let Some(strategy) = health_overlay.strategy {
            health.strategy = Some(strategy);
        }
        if let Some(endpoint) = &health_overlay.endpoint {
            health.endpoint = Some(endpoint.clone());
        }
        if let Some(interval) = health_overlay.interval_seconds {
            health.interval_seconds = interval;
        }
        if let Some(timeout) = health_overlay.timeout_ms {
            health.timeout_ms = timeout;
        }
        if let Some(threshold) = health_overlay.unhealthy_threshold {
            health.unhealthy_threshold = threshold;
        }
        manifest.health = Some(health);
    }

    let mut type_diags = crate::tools::manifest::validate_type_system(&manifest.config);
    diags.append(&mut type_diags);
    diags.sort_by(|a, b| a.field.cmp(&b.field).then(a.code.cmp(&b.code)));

    (manifest, diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::manifest::{ActionSpec, RetryPolicy, ToolMetadata, Transport, TransportType, MANIFEST_SCHEMA_ID, MANIFEST_VERSION};

    fn base_manifest() -> Manifest {
        let mut actions = FxHashMap::default();
        actions.insert(
            "list_s3_objects".to_string(),
            ActionSpec {
                description: "lists objects".into(),
                inputs: FxHashMap::default(),
                outputs: FxHashMap::default(),
                idempotent: true,
                mcp_tool_name: None,
                llm_callable: true,
            },
        );
        Manifest {
            schema: MANIFEST_SCHEMA_ID.to_string(),
            manifest_version: MANIFEST_VERSION.to_string(),
            tool: ToolMetadata {
                name: "s3".into(),
                description: "s3 tool".into(),
                version: "1.0.0".into(),
                author: None,
                homepage: None,
                tags: vec![],
            },
            transport: Transport {
                transport_type: TransportType::Mcp,
                endpoint: None,
                command: Some("s3-mcp".into()),
                args: vec![],
                env: FxHashMap::default(),
                mode: None,
                timeout_ms: 5_000,
                retry: RetryPolicy::default(),
            },
            actions,
            config: FxHashMap::default(),
            health: None,
        }
    }

    #[test]
    fn group_actions_creates_alias() {
        let mut overlay = Overlay {
            overlay_version: OVERLAY_VERSION.to_string(),
            ..Default::default()
        };
        overlay.group_actions.insert("list".to_string(), "list_s3_objects".to_string());
        let (merged, diags) = merge_overlay(&base_manifest(), &overlay);
        assert!(diags.is_empty());
        assert!(merged.actions.contains_key("list"));
        assert_eq!(merged.actions["list"].mcp_tool_name.as_deref(), Some("list_s3_objects"));
    }

    #[test]
    fn alias_to_unknown_tool_is_an_error() {
        let mut overlay = Overlay {
            overlay_version: OVERLAY_VERSION.to_string(),
            ..Default::default()
        };
        overlay.group_actions.insert("list".to_string(), "does_not_exist".to_string());
        let (_, diags) = merge_overlay(&base_manifest(), &overlay);
        assert!(diags.iter().any(|d| d.code == "UNKNOWN_MCP_TOOL"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut overlay = Overlay {
            overlay_version: OVERLAY_VERSION.to_string(),
            ..Default::default()
        };
        overlay.group_actions.insert("list".to_string(), "list_s3_objects".to_string());
        overlay.metadata.author = Some("team".to_string());

        let (once, _) = merge_overlay(&base_manifest(), &overlay);
        let (twice, _) = merge_overlay(&once, &overlay);
        assert_eq!(once.tool.author, twice.tool.author);
        assert_eq!(once.actions.len(), twice.actions.len());
    }
}
