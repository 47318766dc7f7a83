//! Mount-Plan Loader (C8) — validates a session's mount plan and
//! instantiates a [`Coordinator`] from it.
//!
//! A mount plan is immutable once a session exists (`sessions/<id>/mount_plan.json`,
//! written once by [`crate::persistence`]). Two sessions loading the same
//! plan file must produce coordinators whose hook-registration sequences
//! are identical — mounting is a pure function of the plan.

use std::path::PathBuf;
use std::sync::Arc;

use ad_domain::config::{ExecConfig, OrchestratorConfig, ToolPolicy};
use ad_domain::error::{Error, Result};
use ad_providers::ProviderRegistry;
use ad_tools::{
    ExecTool, FileAppendTool, FileDeleteTool, FileListTool, FileMoveTool, FileReadTool, FileWriteTool,
    ProcessManager, ProcessTool, ToolRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::hooks::HookRegistry;
use crate::runtime::approval::{ApprovalDecision, ApprovalStore, PendingApproval};

/// The built-in tools a mount plan may request by name. Referenced
/// (non-builtin) tools are out of this daemon's scope — every tool this
/// spec ships is embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMount {
    Exec,
    Process,
    FileRead,
    FileWrite,
    FileAppend,
    FileMove,
    FileDelete,
    FileList,
}

/// A hook mounted from the plan, by kind rather than arbitrary code — the
/// daemon's built-in hook vocabulary. `priority` follows the plan's
/// declared order, per spec.md §4.8's "priority is set from each hook's
/// config".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMount {
    pub kind: HookKind,
    pub priority: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookKind {
    /// Denies any tool call whose name matches one of `prefixes`.
    DenyToolPrefix { prefixes: Vec<String> },
    /// Enforces the session's [`ToolPolicy`] on every `tool:pre` event.
    ToolPolicy { policy: ToolPolicy },
    /// Pauses an `exec` call whose command matches one of `command_prefixes`
    /// until a human approves or denies it via the REST API, or the
    /// [`ApprovalStore`]'s configured timeout elapses (denied on timeout).
    ApprovalGate { command_prefixes: Vec<String> },
}

/// An immutable, pre-compiled specification of the modules a session
/// loads. Written once to `sessions/<id>/mount_plan.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPlan {
    pub profile_id: String,
    /// Provider ids resolved against the process-wide [`ProviderRegistry`],
    /// in priority order.
    pub provider_ids: Vec<String>,
    pub tools: Vec<ToolMount>,
    pub hooks: Vec<HookMount>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// The session's working directory, injected into every file/exec
    /// tool's config before mount (`amplified_dir` in spec.md §4.8).
    pub workspace_dir: PathBuf,
}

impl MountPlan {
    /// A minimal plan: every built-in tool, no hooks, default orchestrator
    /// tuning, scoped to `workspace_dir`.
    pub fn default_for_workspace(profile_id: impl Into<String>, workspace_dir: PathBuf) -> Self {
        Self {
            profile_id: profile_id.into(),
            provider_ids: Vec::new(),
            tools: vec![
                ToolMount::Exec,
                ToolMount::Process,
                ToolMount::FileRead,
                ToolMount::FileWrite,
                ToolMount::FileAppend,
                ToolMount::FileMove,
                ToolMount::FileDelete,
                ToolMount::FileList,
            ],
            hooks: Vec::new(),
            orchestrator: OrchestratorConfig::default(),
            workspace_dir,
        }
    }
}

/// Mount order, per spec.md §4.8: orchestrator/context-manager slots are
/// plain config (no side effects to order), then providers, then tools,
/// then hooks in plan order.
pub fn load(
    plan: &MountPlan,
    providers: Arc<ProviderRegistry>,
    exec_config: &ExecConfig,
    approvals: Arc<ApprovalStore>,
    session_id: &str,
) -> Result<Coordinator> {
    // Providers: validate every referenced id actually exists.
    for id in &plan.provider_ids {
        if providers.get(id).is_none() {
            return Err(Error::Validation(format!("mount plan references unknown provider '{id}'")));
        }
    }

    // Tools: build a registry scoped to this plan's workspace directory.
    let manager = Arc::new(ProcessManager::new(exec_config.clone()));
    let mut tool_registry = ToolRegistry::new();
    for mount in &plan.tools {
        match mount {
            ToolMount::Exec => {
                tool_registry.register(Arc::new(ExecTool::new(manager.clone(), plan.workspace_dir.clone())))
            }
            ToolMount::Process => tool_registry.register(Arc::new(ProcessTool::new(manager.clone()))),
            ToolMount::FileRead => tool_registry.register(Arc::new(FileReadTool::new(plan.workspace_dir.clone()))),
            ToolMount::FileWrite => tool_registry.register(Arc::new(FileWriteTool::new(plan.workspace_dir.clone()))),
            ToolMount::FileAppend => tool_registry.register(Arc::new(FileAppendTool::new(plan.workspace_dir.clone()))),
            ToolMount::FileMove => tool_registry.register(Arc::new(FileMoveTool::new(plan.workspace_dir.clone()))),
            ToolMount::FileDelete => tool_registry.register(Arc::new(FileDeleteTool::new(plan.workspace_dir.clone()))),
            ToolMount::FileList => tool_registry.register(Arc::new(FileListTool::new(plan.workspace_dir.clone()))),
        }
    }

    // Hooks: register in plan order, each at its declared priority.
    let hooks = HookRegistry::new();
    for mount in &plan.hooks {
        mount_hook(&hooks, mount, &approvals, session_id);
    }

    Ok(Coordinator::new(providers, Arc::new(tool_registry), Arc::new(hooks)))
}

fn mount_hook(hooks: &HookRegistry, mount: &HookMount, approvals: &Arc<ApprovalStore>, session_id: &str) {
    match &mount.kind {
        HookKind::DenyToolPrefix { prefixes } => {
            let prefixes = prefixes.clone();
            hooks.register("tool:pre", mount.priority, &mount.name, move |data| {
                let prefixes = prefixes.clone();
                async move {
                    let tool_name = data.get("tool_name").and_then(|v| v.as_str()).unwrap_or_default();
                    if prefixes.iter().any(|p| tool_name.starts_with(p.as_str())) {
                        ad_domain::event::HookResult::Deny {
                            reason: format!("tool '{tool_name}' matches a denied prefix"),
                        }
                    } else {
                        ad_domain::event::HookResult::Continue
                    }
                }
            });
        }
        HookKind::ToolPolicy { policy } => {
            let policy = policy.clone();
            hooks.register("tool:pre", mount.priority, &mount.name, move |data| {
                let policy = policy.clone();
                async move {
                    let tool_name = data.get("tool_name").and_then(|v| v.as_str()).unwrap_or_default();
                    if policy.allows(tool_name) {
                        ad_domain::event::HookResult::Continue
                    } else {
                        ad_domain::event::HookResult::Deny { reason: format!("tool '{tool_name}' denied by policy") }
                    }
                }
            });
        }
        HookKind::ApprovalGate { command_prefixes } => {
            let command_prefixes = command_prefixes.clone();
            let approvals = approvals.clone();
            let session_id = session_id.to_string();
            let timeout = approvals.timeout();
            hooks.register("tool:pre", mount.priority, &mount.name, move |data| {
                let command_prefixes = command_prefixes.clone();
                let approvals = approvals.clone();
                let session_id = session_id.clone();
                async move {
                    let tool_name = data.get("tool_name").and_then(|v| v.as_str()).unwrap_or_default();
                    let command =
                        data.get("tool_input").and_then(|v| v.get("command")).and_then(|v| v.as_str()).unwrap_or_default();
                    if tool_name != "exec" || !command_prefixes.iter().any(|p| command.starts_with(p.as_str())) {
                        return ad_domain::event::HookResult::Continue;
                    }

                    let (tx, rx) = oneshot::channel();
                    let id = Uuid::new_v4();
                    let info = approvals.insert(PendingApproval {
                        id,
                        command: command.to_string(),
                        session_key: session_id.clone(),
                        created_at: chrono::Utc::now(),
                        respond: tx,
                    });
                    tracing::info!(approval_id = %info.id, command = %info.command, "awaiting approval for exec command");

                    match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(ApprovalDecision::Approved)) => ad_domain::event::HookResult::Continue,
                        Ok(Ok(ApprovalDecision::Denied { reason })) => {
                            ad_domain::event::HookResult::Deny { reason: reason.unwrap_or_else(|| "denied by reviewer".into()) }
                        }
                        Ok(Err(_)) | Err(_) => {
                            approvals.remove_expired(&id);
                            ad_domain::event::HookResult::Deny { reason: "Approval request timed out".into() }
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::approval::ApprovalStore;
    use ad_domain::config::LlmConfig;
    use std::time::Duration;

    fn providers() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::from_config(&LlmConfig::default()).unwrap())
    }

    fn approvals() -> Arc<ApprovalStore> {
        let tmp = tempfile::tempdir().unwrap().into_path();
        Arc::new(ApprovalStore::new(Duration::from_millis(200), tmp.join("approvals.jsonl")))
    }

    #[test]
    fn default_plan_mounts_every_builtin_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        let coordinator = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();
        assert_eq!(coordinator.tools.len(), 8);
        assert!(coordinator.tools.get("exec").is_some());
        assert!(coordinator.tools.get("file_write").is_some());
    }

    #[test]
    fn unknown_provider_id_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.provider_ids.push("nonexistent".into());
        let err = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn deny_tool_prefix_hook_denies_matching_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.hooks.push(HookMount {
            kind: HookKind::DenyToolPrefix { prefixes: vec!["exec".into()] },
            priority: 0,
            name: "deny-exec".into(),
        });
        let coordinator = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();

        let mut data = serde_json::Map::new();
        data.insert("tool_name".into(), serde_json::json!("exec"));
        let outcome = coordinator.hooks.emit("tool:pre", data).await;
        assert!(outcome.is_denied());
    }

    #[test]
    fn same_plan_produces_identical_hook_registration_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.hooks.push(HookMount {
            kind: HookKind::DenyToolPrefix { prefixes: vec!["exec".into()] },
            priority: 5,
            name: "a".into(),
        });
        plan.hooks.push(HookMount {
            kind: HookKind::DenyToolPrefix { prefixes: vec!["process".into()] },
            priority: 1,
            name: "b".into(),
        });

        let c1 = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();
        let c2 = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();
        assert_eq!(c1.hooks.handler_count("tool:pre"), c2.hooks.handler_count("tool:pre"));
        assert_eq!(c1.hooks.handler_count("tool:pre"), 2);
    }

    #[tokio::test]
    async fn approval_gate_allows_when_approved() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.hooks.push(HookMount {
            kind: HookKind::ApprovalGate { command_prefixes: vec!["rm ".into()] },
            priority: 0,
            name: "approval-gate".into(),
        });
        let store = approvals();
        let coordinator = load(&plan, providers(), &ExecConfig::default(), store.clone(), "s1").unwrap();

        let mut data = serde_json::Map::new();
        data.insert("tool_name".into(), serde_json::json!("exec"));
        data.insert("tool_input".into(), serde_json::json!({ "command": "rm -rf /tmp/x" }));

        let emit = coordinator.hooks.emit("tool:pre", data);
        tokio::spawn(async move {
            loop {
                let pending = store.list_pending();
                if let Some(info) = pending.first() {
                    store.approve(&info.id);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let outcome = emit.await;
        assert!(!outcome.is_denied());
    }

    #[tokio::test]
    async fn approval_gate_denies_on_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.hooks.push(HookMount {
            kind: HookKind::ApprovalGate { command_prefixes: vec!["rm ".into()] },
            priority: 0,
            name: "approval-gate".into(),
        });
        let coordinator = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();

        let mut data = serde_json::Map::new();
        data.insert("tool_name".into(), serde_json::json!("exec"));
        data.insert("tool_input".into(), serde_json::json!({ "command": "rm -rf /tmp/x" }));

        let outcome = coordinator.hooks.emit("tool:pre", data).await;
        assert!(outcome.is_denied());
    }

    #[tokio::test]
    async fn approval_gate_ignores_non_matching_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        plan.hooks.push(HookMount {
            kind: HookKind::ApprovalGate { command_prefixes: vec!["rm ".into()] },
            priority: 0,
            name: "approval-gate".into(),
        });
        let coordinator = load(&plan, providers(), &ExecConfig::default(), approvals(), "s1").unwrap();

        let mut data = serde_json::Map::new();
        data.insert("tool_name".into(), serde_json::json!("exec"));
        data.insert("tool_input".into(), serde_json::json!({ "command": "ls -la" }));

        let outcome = coordinator.hooks.emit("tool:pre", data).await;
        assert!(!outcome.is_denied());
    }

    #[test]
    fn mount_plan_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = MountPlan::default_for_workspace("default", tmp.path().to_path_buf());
        let json = serde_json::to_string(&plan).unwrap();
        let back: MountPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.profile_id, plan.profile_id);
        assert_eq!(back.tools.len(), plan.tools.len());
    }
}
