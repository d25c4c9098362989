//! Stage derivation (SPEC_FULL.md §4.9): which of plan/build/test the
//! orchestrator loop is currently operating in for a project.

use agenterm_types::{Project, Task, TaskStatus, Workflow, Worktree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Plan,
    Build,
    Test,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
        }
    }
}

const BUILD_TASK_STATUSES: &[&str] = &[
    "pending",
    "planned",
    "planning",
    "ready",
    "todo",
    "queued",
    "running",
    "in_progress",
    "reviewing",
    "waiting_review",
    "blocked",
];
const BUILD_WORKTREE_STATUSES: &[&str] = &["", "active", "created", "in_progress", "running", "open"];
const DONE_TASK_STATUSES: &[&str] = &["done", "completed", "merged", "closed"];

/// Derives the active stage per SPEC_FULL.md §4.9.
pub fn derive_stage(project: &Project, tasks: &[Task], worktrees: &[Worktree], workflow: Option<&Workflow>) -> Stage {
    let status_lower = project.status.to_ascii_lowercase();
    if status_lower.contains("plan") && enabled(workflow, "plan") {
        return Stage::Plan;
    }
    if (status_lower.contains("test") || status_lower.contains("testing") || status_lower.contains("qa") || status_lower.contains("verifying"))
        && enabled(workflow, "test")
    {
        return Stage::Test;
    }
    if (status_lower.contains("build") || status_lower.contains("building") || status_lower.contains("developing"))
        && enabled(workflow, "build")
    {
        return Stage::Build;
    }

    let task_status_str = |t: &Task| t.status.as_str();
    let any_build_task = tasks.iter().any(|t| BUILD_TASK_STATUSES.contains(&task_status_str(t)));
    let any_active_worktree = worktrees
        .iter()
        .any(|w| BUILD_WORKTREE_STATUSES.contains(&w.status.to_ascii_lowercase().as_str()));
    if any_build_task || any_active_worktree {
        return Stage::Build;
    }

    let all_done = !tasks.is_empty() && tasks.iter().all(|t| DONE_TASK_STATUSES.contains(&task_status_str(t)));
    if all_done && !any_active_worktree {
        return if enabled(workflow, "test") { Stage::Test } else { Stage::Build };
    }

    if tasks.is_empty() && worktrees.is_empty() && enabled(workflow, "plan") {
        return Stage::Plan;
    }

    for candidate in [Stage::Plan, Stage::Build, Stage::Test] {
        if enabled(workflow, candidate.as_str()) {
            return candidate;
        }
    }
    Stage::Build
}

fn enabled(workflow: Option<&Workflow>, phase_type: &str) -> bool {
    match workflow {
        Some(workflow) => workflow.phases.iter().any(|p| p.phase_type == phase_type),
        None => true,
    }
}

#[allow(dead_code)]
fn unused_task_status_guard(_: TaskStatus) {}

#[cfg(test)]
mod tests {
    use super::*;
    use agenterm_types::{Project, Task, Worktree};

    fn project_with_status(status: &str) -> Project {
        let mut p = Project::new("demo", "/repos/demo");
        p.status = status.to_string();
        p
    }

    #[test]
    fn explicit_status_keyword_overrides() {
        let project = project_with_status("planning");
        assert_eq!(derive_stage(&project, &[], &[], None), Stage::Plan);
    }

    #[test]
    fn pending_task_derives_build() {
        let project = project_with_status("active");
        let task = Task::new(project.id.clone(), "write parser");
        assert_eq!(derive_stage(&project, &[task], &[], None), Stage::Build);
    }

    #[test]
    fn all_done_tasks_and_no_worktrees_derive_test() {
        let project = project_with_status("active");
        let mut task = Task::new(project.id.clone(), "write parser");
        task.status = TaskStatus::Done;
        assert_eq!(derive_stage(&project, &[task], &[], None), Stage::Test);
    }

    #[test]
    fn no_tasks_no_worktrees_derives_plan() {
        let project = project_with_status("active");
        assert_eq!(derive_stage(&project, &[], &[], None), Stage::Plan);
    }

    #[test]
    fn active_worktree_derives_build_even_with_no_tasks() {
        let project = project_with_status("active");
        let worktree = Worktree::new(project.id.clone(), "feature", "/repos/demo/wt");
        assert_eq!(derive_stage(&project, &[], &[worktree], None), Stage::Build);
    }
}
