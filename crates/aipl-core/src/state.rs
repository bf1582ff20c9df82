//! Task status state machine and the workspace-level transition event log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Task;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    Doing,
    Stale,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Stale => "stale",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Allowed transitions. `None` as the source denotes task creation.
///
/// ```text
///   ∅      -> todo
///   todo   -> doing | canceled
///   doing  -> done | failed | canceled | stale
///   stale  -> todo | doing | canceled
///   done / failed / canceled -> (terminal)
/// ```
pub fn is_valid_transition(from: Option<TaskStatus>, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match from {
        None => to == Todo,
        Some(Todo) => matches!(to, Doing | Canceled),
        Some(Doing) => matches!(to, Done | Failed | Canceled | Stale),
        Some(Stale) => matches!(to, Todo | Doing | Canceled),
        Some(Done) | Some(Failed) | Some(Canceled) => false,
    }
}

/// One `status_transition` record appended to the workspace event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionEvent {
    #[serde(rename = "type")]
    pub kind: String,

    pub task_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub ts: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
}

/// Apply a status transition in place.
///
/// Returns the transition event, or `None` when the transition is a no-op
/// (same status) or not allowed by the matrix. Entering `doing` bumps the
/// heartbeat; entering `stale` stamps `stale_ts` and increments `stale_count`.
pub fn transition_task(
    task: &mut Task,
    to: TaskStatus,
    now: f64,
    source: Option<&str>,
    reason: Option<Value>,
) -> Option<TransitionEvent> {
    let from = task.status;
    if from == to {
        return None;
    }
    if !is_valid_transition(Some(from), to) {
        return None;
    }
    task.status = to;
    task.status_ts = Some(now);
    if to == TaskStatus::Doing {
        task.heartbeat_ts = Some(now);
    }
    if to == TaskStatus::Stale {
        task.stale_ts = Some(now);
        task.stale_count += 1;
    }
    Some(TransitionEvent {
        kind: "status_transition".to_string(),
        task_id: task.id.clone(),
        plan_id: task.plan_id.clone(),
        from: Some(from),
        to,
        ts: now,
        source: source.map(str::to_string),
        reason,
    })
}

pub fn touch_heartbeat(task: &mut Task, now: f64) {
    task.heartbeat_ts = Some(now);
}

/// The timestamp a `doing` task is judged against for staleness: the most
/// recent of heartbeat, status change, and creation.
fn stale_reference_ts(task: &Task) -> Option<f64> {
    [task.heartbeat_ts, task.status_ts, task.created_ts]
        .into_iter()
        .flatten()
        .filter(|ts| *ts > 0.0)
        .fold(None, |acc: Option<f64>, ts| {
            Some(acc.map_or(ts, |prev| prev.max(ts)))
        })
}

/// Mark overdue `doing` tasks as `stale`, optionally chaining back to `todo`
/// when auto-reset is enabled. Returns the transition events produced.
pub fn scan_tasks_for_stale(
    tasks: &mut [Task],
    stale_after_seconds: u64,
    auto_reset: bool,
    now: f64,
    source: &str,
) -> Vec<TransitionEvent> {
    let mut events = Vec::new();
    if stale_after_seconds == 0 {
        return events;
    }
    for task in tasks.iter_mut() {
        if task.status != TaskStatus::Doing {
            continue;
        }
        let Some(ref_ts) = stale_reference_ts(task) else {
            continue;
        };
        let age = now - ref_ts;
        if age < stale_after_seconds as f64 {
            continue;
        }
        let reason = serde_json::json!({"type": "stale", "age_seconds": age as u64});
        if let Some(event) =
            transition_task(task, TaskStatus::Stale, now, Some(source), Some(reason.clone()))
        {
            events.push(event);
        }
        if auto_reset {
            if let Some(event) =
                transition_task(task, TaskStatus::Todo, now, Some(source), Some(reason))
            {
                events.push(event);
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn doing_task(id: &str, heartbeat: f64) -> Task {
        let mut task = Task::new(id, "");
        task.status = TaskStatus::Doing;
        task.heartbeat_ts = Some(heartbeat);
        task
    }

    // ── Transition matrix ───────────────────────────────────────────

    #[test]
    fn test_creation_only_to_todo() {
        assert!(is_valid_transition(None, TaskStatus::Todo));
        assert!(!is_valid_transition(None, TaskStatus::Doing));
        assert!(!is_valid_transition(None, TaskStatus::Done));
    }

    #[test]
    fn test_todo_transitions() {
        assert!(is_valid_transition(Some(TaskStatus::Todo), TaskStatus::Doing));
        assert!(is_valid_transition(Some(TaskStatus::Todo), TaskStatus::Canceled));
        assert!(!is_valid_transition(Some(TaskStatus::Todo), TaskStatus::Done));
        assert!(!is_valid_transition(Some(TaskStatus::Todo), TaskStatus::Stale));
    }

    #[test]
    fn test_doing_transitions() {
        for to in [
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::Stale,
        ] {
            assert!(is_valid_transition(Some(TaskStatus::Doing), to));
        }
        assert!(!is_valid_transition(Some(TaskStatus::Doing), TaskStatus::Todo));
    }

    #[test]
    fn test_stale_transitions() {
        for to in [TaskStatus::Todo, TaskStatus::Doing, TaskStatus::Canceled] {
            assert!(is_valid_transition(Some(TaskStatus::Stale), to));
        }
        assert!(!is_valid_transition(Some(TaskStatus::Stale), TaskStatus::Done));
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Canceled] {
            for to in [
                TaskStatus::Todo,
                TaskStatus::Doing,
                TaskStatus::Stale,
                TaskStatus::Done,
                TaskStatus::Failed,
                TaskStatus::Canceled,
            ] {
                assert!(!is_valid_transition(Some(from), to), "{from} -> {to}");
            }
        }
    }

    // ── transition_task ─────────────────────────────────────────────

    #[test]
    fn test_transition_updates_bookkeeping() {
        let mut task = Task::new("T1", "");
        let event = transition_task(&mut task, TaskStatus::Doing, 100.0, Some("controller"), None)
            .expect("todo -> doing is valid");
        assert_eq!(task.status, TaskStatus::Doing);
        assert_eq!(task.heartbeat_ts, Some(100.0));
        assert_eq!(task.status_ts, Some(100.0));
        assert_eq!(event.from, Some(TaskStatus::Todo));
        assert_eq!(event.to, TaskStatus::Doing);
        assert_eq!(event.source.as_deref(), Some("controller"));
        assert_eq!(event.kind, "status_transition");
    }

    #[test]
    fn test_transition_same_status_is_noop() {
        let mut task = Task::new("T1", "");
        assert!(transition_task(&mut task, TaskStatus::Todo, 1.0, None, None).is_none());
    }

    #[test]
    fn test_invalid_transition_leaves_task_untouched() {
        let mut task = Task::new("T1", "");
        task.status = TaskStatus::Done;
        assert!(transition_task(&mut task, TaskStatus::Doing, 1.0, None, None).is_none());
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn test_stale_increments_count() {
        let mut task = doing_task("T1", 1.0);
        transition_task(&mut task, TaskStatus::Stale, 2.0, None, None).unwrap();
        assert_eq!(task.stale_count, 1);
        assert_eq!(task.stale_ts, Some(2.0));
        transition_task(&mut task, TaskStatus::Doing, 3.0, None, None).unwrap();
        transition_task(&mut task, TaskStatus::Stale, 4.0, None, None).unwrap();
        assert_eq!(task.stale_count, 2);
    }

    // ── Stale scanner ───────────────────────────────────────────────

    #[test]
    fn test_scan_marks_overdue_doing_tasks() {
        let mut tasks = vec![doing_task("T1", 100.0), doing_task("T2", 4000.0)];
        let events = scan_tasks_for_stale(&mut tasks, 3600, false, 4100.0, "scanner");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, "T1");
        assert_eq!(tasks[0].status, TaskStatus::Stale);
        assert_eq!(tasks[1].status, TaskStatus::Doing);
    }

    #[test]
    fn test_scan_auto_reset_chains_to_todo() {
        let mut tasks = vec![doing_task("T1", 0.5)];
        let events = scan_tasks_for_stale(&mut tasks, 60, true, 1000.0, "scanner");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to, TaskStatus::Stale);
        assert_eq!(events[1].to, TaskStatus::Todo);
        assert_eq!(tasks[0].status, TaskStatus::Todo);
        assert_eq!(tasks[0].stale_count, 1);
    }

    #[test]
    fn test_scan_skips_non_doing_and_zero_window() {
        let mut tasks = vec![Task::new("T1", "")];
        assert!(scan_tasks_for_stale(&mut tasks, 3600, false, 1e12, "scanner").is_empty());
        let mut doing = vec![doing_task("T2", 1.0)];
        assert!(scan_tasks_for_stale(&mut doing, 0, false, 1e12, "scanner").is_empty());
    }

    #[test]
    fn test_scan_uses_most_recent_reference_ts() {
        let mut task = doing_task("T1", 100.0);
        task.status_ts = Some(5000.0);
        let mut tasks = vec![task];
        // heartbeat is ancient but status_ts is fresh enough
        let events = scan_tasks_for_stale(&mut tasks, 3600, false, 5100.0, "scanner");
        assert!(events.is_empty());
    }

    #[test]
    fn test_no_consecutive_events_share_to_status() {
        // A stale+auto-reset chain alternates stale -> todo, never repeats.
        let mut tasks = vec![doing_task("T1", 1.0)];
        let events = scan_tasks_for_stale(&mut tasks, 1, true, 100.0, "scanner");
        for pair in events.windows(2) {
            assert_ne!(pair[0].to, pair[1].to);
        }
    }

    #[test]
    fn test_transition_event_serde() {
        let mut task = Task::new("T1", "");
        task.plan_id = Some("plan-20250101-000000".into());
        let event =
            transition_task(&mut task, TaskStatus::Doing, 42.0, Some("controller"), None).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_transition");
        assert_eq!(json["from"], "todo");
        assert_eq!(json["to"], "doing");
        assert_eq!(json["plan_id"], "plan-20250101-000000");
        let back: TransitionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
