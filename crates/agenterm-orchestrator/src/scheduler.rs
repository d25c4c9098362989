//! Admission control (C5): `checkSessionCreationAllowed`, SPEC_FULL.md §4.2.
//! A pure read over the repository layer — no mutation, deny-first precedence.

use agenterm_core::Storage;
use agenterm_types::{AgentConfig, Session};

/// What the caller is asking permission to create.
#[derive(Debug, Clone, Default)]
pub struct SessionCreationRequest {
    pub task_id: String,
    pub role: Option<String>,
    pub agent_type: Option<String>,
    /// The requested agent's catalog entry, when known; supplies its model
    /// and `max_parallel_agents` cap for steps 5 and 7.
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone)]
pub struct SchedulerDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub resolved_model: Option<String>,
}

impl SchedulerDecision {
    fn allow(resolved_model: Option<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            resolved_model,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            resolved_model: None,
        }
    }
}

pub struct Scheduler {
    storage: Storage,
    /// Process-wide cap across every project and role; `None` is unlimited.
    /// Sourced from configuration at startup (SPEC_FULL.md §4.11).
    global_max_parallel: Option<u32>,
}

impl Scheduler {
    pub fn new(storage: Storage, global_max_parallel: Option<u32>) -> Self {
        Self {
            storage,
            global_max_parallel,
        }
    }

    pub async fn check_session_creation_allowed(
        &self,
        request: &SessionCreationRequest,
    ) -> anyhow::Result<SchedulerDecision> {
        // Step 1: resolve task -> project.
        let Some(task) = self.storage.get_task(&request.task_id).await? else {
            return Ok(SchedulerDecision::deny(format!(
                "task `{}` does not exist",
                request.task_id
            )));
        };
        let project_id = task.project_id.clone();

        // Step 2: project profile is optional.
        let profile = self.storage.get_project_orchestrator(&project_id).await?;
        let Some(profile) = profile else {
            return Ok(SchedulerDecision::allow(
                request.agent.as_ref().and_then(|a| a.model.clone()),
            ));
        };

        let role = request.role.clone().unwrap_or_default();

        // Step 3: role-agent-assignment requires a matching agent_type.
        let role_agent_assignment = self
            .storage
            .get_role_agent_assignment(&project_id, &role)
            .await?;
        if let Some(assignment) = &role_agent_assignment {
            match &request.agent_type {
                Some(agent_type) if agent_type.eq_ignore_ascii_case(&assignment.agent_type) => {}
                _ => {
                    return Ok(SchedulerDecision::deny(format!(
                        "role_agent_assignment requires agent_type `{}`",
                        assignment.agent_type
                    )));
                }
            }
        }

        // Step 4: active-session counts.
        let sessions = self.storage.list_sessions().await?;
        let active: Vec<&Session> = sessions.iter().filter(|s| s.counts_as_active()).collect();

        let project_task_ids: std::collections::HashSet<String> = self
            .storage
            .list_tasks_for_project(&project_id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let in_project = |s: &Session| {
            s.task_id
                .as_ref()
                .is_some_and(|t| project_task_ids.contains(t))
        };

        let project_count = active.iter().filter(|s| in_project(s)).count();
        let project_role_count = active
            .iter()
            .filter(|s| in_project(s) && s.role == role)
            .count();
        let global_count = active.len();

        // Step 5: resolve target model.
        let role_binding = self.storage.get_role_binding(&project_id, &role).await?;
        let requested_model = request.agent.as_ref().and_then(|a| a.model.clone());
        let resolved_model = if let Some(binding_model) =
            role_binding.as_ref().and_then(|b| b.model.clone())
        {
            if let Some(requested) = &requested_model {
                if !requested.eq_ignore_ascii_case(&binding_model) {
                    return Ok(SchedulerDecision::deny("agent model mismatch"));
                }
            }
            Some(binding_model)
        } else {
            requested_model.or_else(|| profile.default_model.clone())
        };

        let global_model_count = resolved_model.as_ref().map(|model| {
            active
                .iter()
                .filter(|s| {
                    s.model
                        .as_deref()
                        .is_some_and(|m| m.eq_ignore_ascii_case(model))
                })
                .count()
        });

        // Step 6: workflow role policy.
        let mut workflow_cap: Option<u32> = None;
        if let Some(workflow_id) = profile_workflow_id(&profile) {
            if let Some(workflow) = self.storage.get_workflow(&workflow_id).await? {
                workflow_cap = workflow
                    .phases
                    .iter()
                    .filter(|phase| phase.role == role && phase.max_parallel > 0)
                    .map(|phase| phase.max_parallel)
                    .min();
            }
        }

        // Step 7: apply caps in order, deny-first.
        if let Some(cap) = self.global_max_parallel {
            if global_count as u32 >= cap {
                return Ok(SchedulerDecision::deny(format!(
                    "global max_parallel ({cap}) reached"
                )));
            }
        }
        if let Some(cap) = profile.max_parallel {
            if project_count as u32 >= cap {
                return Ok(SchedulerDecision::deny(format!(
                    "project max_parallel ({cap}) reached"
                )));
            }
        }
        if let Some(cap) = workflow_cap {
            if project_role_count as u32 >= cap {
                return Ok(SchedulerDecision::deny(format!(
                    "workflow phase max_parallel ({cap}) reached for role `{role}`"
                )));
            }
        }
        if let Some(binding) = &role_binding {
            if let Some(cap) = binding.max_parallel {
                if project_role_count as u32 >= cap {
                    return Ok(SchedulerDecision::deny(format!(
                        "role binding max_parallel ({cap}) reached for role `{role}`"
                    )));
                }
            }
        }
        // role binding model max_parallel: reuses the same binding's cap
        // scoped to the resolved model rather than the role alone.
        if let (Some(binding), Some(model_count)) = (&role_binding, global_model_count) {
            if binding.model.is_some() {
                if let Some(cap) = binding.max_parallel {
                    if model_count as u32 >= cap {
                        return Ok(SchedulerDecision::deny(format!(
                            "role binding model max_parallel ({cap}) reached"
                        )));
                    }
                }
            }
        }
        if let Some(assignment) = &role_agent_assignment {
            if let Some(cap) = assignment.max_parallel {
                if project_role_count as u32 >= cap {
                    return Ok(SchedulerDecision::deny(format!(
                        "role_agent_assignment max_parallel ({cap}) reached for role `{role}`"
                    )));
                }
            }
        }
        if let Some(agent) = &request.agent {
            if agent.max_parallel_agents > 0 {
                let agent_count = active
                    .iter()
                    .filter(|s| s.agent_type.eq_ignore_ascii_case(&agent.id))
                    .count();
                if agent_count as u32 >= agent.max_parallel_agents {
                    return Ok(SchedulerDecision::deny(format!(
                        "registered agent max_parallel_agents ({}) reached",
                        agent.max_parallel_agents
                    )));
                }
            }
        }

        // Step 8.
        Ok(SchedulerDecision::allow(resolved_model))
    }
}

fn profile_workflow_id(profile: &agenterm_types::ProjectOrchestrator) -> Option<String> {
    if profile.workflow_id.is_empty() {
        None
    } else {
        Some(profile.workflow_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenterm_types::{Project, ProjectOrchestrator, RoleBinding, Task};

    async fn project_with_profile(storage: &Storage, max_parallel: Option<u32>) -> (Project, Task) {
        let project = Project::new("demo", "/repos/demo");
        storage.put_project(&project).await.unwrap();
        storage
            .put_project_orchestrator(&ProjectOrchestrator {
                project_id: project.id.clone(),
                workflow_id: String::new(),
                default_provider: None,
                default_model: None,
                max_parallel,
                review_policy: String::new(),
                notify_on_blocked: false,
            })
            .await
            .unwrap();
        let task = Task::new(project.id.clone(), "write parser");
        storage.put_task(&task).await.unwrap();
        (project, task)
    }

    #[tokio::test]
    async fn allows_when_no_profile_exists() {
        let storage = Storage::in_memory().await.unwrap();
        let project = Project::new("demo", "/repos/demo");
        storage.put_project(&project).await.unwrap();
        let task = Task::new(project.id.clone(), "write parser");
        storage.put_task(&task).await.unwrap();

        let scheduler = Scheduler::new(storage, None);
        let decision = scheduler
            .check_session_creation_allowed(&SessionCreationRequest {
                task_id: task.id,
                role: Some("coder".to_string()),
                agent_type: Some("codex".to_string()),
                agent: None,
            })
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn denies_second_session_over_project_max_parallel() {
        let storage = Storage::in_memory().await.unwrap();
        let (_project, task) = project_with_profile(&storage, Some(1)).await;

        let mut existing = Session::new("demo-task-coder", "demo-task-coder:0", "codex", "coder");
        existing.task_id = Some(task.id.clone());
        storage.put_session(&existing).await.unwrap();

        let task2 = Task::new(task.project_id.clone(), "second task");
        storage.put_task(&task2).await.unwrap();

        let scheduler = Scheduler::new(storage, None);
        let decision = scheduler
            .check_session_creation_allowed(&SessionCreationRequest {
                task_id: task2.id,
                role: Some("tester".to_string()),
                agent_type: Some("codex".to_string()),
                agent: None,
            })
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("project max_parallel"));
    }

    #[tokio::test]
    async fn denies_on_role_binding_model_mismatch() {
        let storage = Storage::in_memory().await.unwrap();
        let (project, task) = project_with_profile(&storage, None).await;
        storage
            .put_role_binding(&RoleBinding {
                project_id: project.id.clone(),
                role: "coder".to_string(),
                provider: None,
                model: Some("claude-opus".to_string()),
                max_parallel: None,
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(storage, None);
        let decision = scheduler
            .check_session_creation_allowed(&SessionCreationRequest {
                task_id: task.id,
                role: Some("coder".to_string()),
                agent_type: Some("codex".to_string()),
                agent: Some(AgentConfig {
                    id: "codex".to_string(),
                    name: "Codex".to_string(),
                    command: "codex".to_string(),
                    resume_command: None,
                    headless_command: None,
                    capabilities: vec![],
                    languages: vec![],
                    tiers: vec![],
                    max_parallel_agents: 0,
                    auto_accept_mode: None,
                    supports_orchestrator: true,
                    provider: None,
                    model: Some("gpt-5".to_string()),
                    api_base: None,
                }),
            })
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("agent model mismatch"));
    }

    #[tokio::test]
    async fn denies_missing_role_agent_assignment_match() {
        let storage = Storage::in_memory().await.unwrap();
        let (project, task) = project_with_profile(&storage, None).await;
        storage
            .put_role_agent_assignment(&agenterm_types::RoleAgentAssignment {
                project_id: project.id.clone(),
                stage: "build".to_string(),
                role: "coder".to_string(),
                agent_type: "codex".to_string(),
                max_parallel: None,
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(storage, None);
        let decision = scheduler
            .check_session_creation_allowed(&SessionCreationRequest {
                task_id: task.id,
                role: Some("coder".to_string()),
                agent_type: Some("claude-code".to_string()),
                agent: None,
            })
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("role_agent_assignment"));
    }
}
