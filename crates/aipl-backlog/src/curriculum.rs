//! Rule-based curriculum: synthesizes the next objectively verifiable task
//! when the backlog has nothing runnable and no plan filter is in force.

use serde_json::json;

use aipl_core::types::{Check, Task};

struct LadderStep {
    id: &'static str,
    title: &'static str,
    deps: &'static [&'static str],
    criteria: &'static [&'static str],
    checks: &'static [(&'static str, &'static str, &'static str)],
}

const LADDER: [LadderStep; 3] = [
    LadderStep {
        id: "T001",
        title: "Generate deliverable file",
        deps: &[],
        criteria: &[
            "outputs/result.txt exists",
            "result.txt is exactly one line: OK: deliverable generated",
        ],
        checks: &[("file_contains", "outputs/result.txt", "OK: deliverable generated")],
    },
    LadderStep {
        id: "T002",
        title: "Create a human-readable summary",
        deps: &["T001"],
        criteria: &["outputs/summary.md exists", "summary.md contains Task and Run"],
        checks: &[("file_contains", "outputs/summary.md", "Task")],
    },
    LadderStep {
        id: "T003",
        title: "Produce a run report index",
        deps: &["T002"],
        criteria: &["index.md exists", "index.md contains Evidence section"],
        checks: &[("file_contains", "outputs/index.md", "Evidence")],
    },
];

/// First ladder step missing from the backlog, as a ready-to-append task.
pub fn suggest_next_task(goal: &str, existing: &[Task], now: f64) -> Option<Task> {
    let existing_ids: std::collections::HashSet<&str> =
        existing.iter().map(|task| task.id.as_str()).collect();
    let step = LADDER.iter().find(|step| !existing_ids.contains(step.id))?;

    let mut task = Task::new(step.id, step.title);
    task.priority = 50;
    task.estimated_minutes = Some(20);
    task.dependencies = step.deps.iter().map(|d| d.to_string()).collect();
    task.acceptance_criteria = step.criteria.iter().map(|c| c.to_string()).collect();
    task.checks = step
        .checks
        .iter()
        .filter_map(|(kind, path, needle)| {
            serde_json::from_value::<Check>(json!({
                "type": kind, "path": path, "needle": needle
            }))
            .ok()
        })
        .collect();
    task.created_from_goal = Some(goal.trim().to_string());
    task.created_ts = Some(now);
    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggests_first_missing_step() {
        let suggested = suggest_next_task("ship it", &[], 1.0).unwrap();
        assert_eq!(suggested.id, "T001");
        assert_eq!(suggested.priority, 50);
        assert!(suggested.dependencies.is_empty());
        assert_eq!(suggested.created_from_goal.as_deref(), Some("ship it"));
        assert!(!suggested.checks.is_empty());
    }

    #[test]
    fn test_ladder_advances_past_existing() {
        let existing = vec![Task::new("T001", "")];
        let suggested = suggest_next_task("", &existing, 1.0).unwrap();
        assert_eq!(suggested.id, "T002");
        assert_eq!(suggested.dependencies, vec!["T001"]);
    }

    #[test]
    fn test_exhausted_ladder_returns_none() {
        let existing = vec![
            Task::new("T001", ""),
            Task::new("T002", ""),
            Task::new("T003", ""),
        ];
        assert!(suggest_next_task("", &existing, 1.0).is_none());
    }
}
