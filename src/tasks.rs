use serde::Serialize;
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

use crate::models::{ContentPart, DocumentTree};

const THINKING_END: &str = "thinking-end";
const DIAGNOSTICS_PASSED: &str = "diagnostics-passed";
const DIAGNOSTICS_FAILED: &str = "diagnostics-failed";
const FALLBACK_LABEL: &str = "Processing...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Thinking,
    Search,
    Code,
    Diagnostics,
}

impl TaskKind {
    /// Map a content-part `type` to the kind of progress it reports.
    pub fn from_part_type(part_type: &str) -> Option<Self> {
        match part_type {
            "task-thinking-v1" => Some(Self::Thinking),
            "task-search-repo-v1" | "task-search-web-v1" => Some(Self::Search),
            "task-coding-v1" => Some(Self::Code),
            t if t.contains("diagnostics") => Some(Self::Diagnostics),
            _ => None,
        }
    }
}

/// Lifecycle of one tracked task. Ordered: a tracker only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Complete,
}

impl TaskState {
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Pending => "⬜",
            Self::Active => "⏳",
            Self::Complete => "✅",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskTracker {
    pub id: String,
    pub kind: TaskKind,
    pub active_label: Option<String>,
    pub complete_label: Option<String>,
    pub state: TaskState,
}

impl TaskTracker {
    /// Label for the tracker's current state.
    pub fn label(&self) -> &str {
        let complete = match self.state {
            TaskState::Complete => self.complete_label.as_deref(),
            _ => None,
        };
        complete
            .or(self.active_label.as_deref())
            .unwrap_or(FALLBACK_LABEL)
    }

    pub fn status_line(&self) -> String {
        format!("\n{} {}", self.state.marker(), self.label())
    }
}

/// Trackers for one stream run, in the order they were first seen.
#[derive(Debug, Clone, Default)]
pub struct TaskTrackers {
    trackers: Vec<TaskTracker>,
    index: HashMap<String, usize>,
}

impl TaskTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&TaskTracker> {
        self.index.get(id).map(|i| &self.trackers[*i])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TaskTracker> {
        let i = *self.index.get(id)?;
        self.trackers.get_mut(i)
    }

    fn insert(&mut self, tracker: TaskTracker) {
        self.index.insert(tracker.id.clone(), self.trackers.len());
        self.trackers.push(tracker);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskTracker> {
        self.trackers.iter()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingFact {
    pub duration_secs: u64,
}

impl ThinkingFact {
    pub fn status_line(&self) -> String {
        format!("\n\n_Thought for {}s_\n\n", self.duration_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiagnosticFact {
    pub id: String,
    pub passed: bool,
    pub label: String,
}

impl DiagnosticFact {
    pub fn status_line(&self) -> String {
        let marker = if self.passed { "✅" } else { "⚠️" };
        format!("\n{} {}", marker, self.label)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub thinking: Option<ThinkingFact>,
    pub tasks: Vec<TaskTracker>,
    pub diagnostics: Vec<DiagnosticFact>,
}

// ============================================================================
// Extraction
// ============================================================================

/// Scan a snapshot for progress parts and advance `trackers`.
///
/// Thinking and diagnostics facts are reported on every call while present;
/// deduplicating them is up to the caller. Search and code tasks only move
/// `active -> complete`; a task first seen already finished is ignored.
pub fn extract(tree: &DocumentTree, trackers: &mut TaskTrackers) -> TaskInfo {
    let mut info = TaskInfo::default();

    for part in tree.content_parts() {
        match TaskKind::from_part_type(&part.kind) {
            Some(TaskKind::Thinking) => {
                if let Some(fact) = thinking_fact(part) {
                    info.thinking = Some(fact);
                }
            }
            Some(kind @ (TaskKind::Search | TaskKind::Code)) => track(part, kind, trackers),
            Some(TaskKind::Diagnostics) => info.diagnostics.extend(diagnostic_facts(part)),
            None => {}
        }
    }

    info.tasks = trackers.iter().cloned().collect();
    info
}

fn thinking_fact(part: &ContentPart) -> Option<ThinkingFact> {
    if !part.is_finished() {
        return None;
    }
    part.parts
        .iter()
        .filter(|p| p.kind == THINKING_END)
        .filter_map(|p| p.duration)
        .filter(|d| *d > 0.0)
        .last()
        .map(|d| ThinkingFact {
            duration_secs: d.round() as u64,
        })
}

fn track(part: &ContentPart, kind: TaskKind, trackers: &mut TaskTrackers) {
    let id = part.id.clone().unwrap_or_default();

    if trackers.get(&id).is_none() {
        if let Some(active) = &part.task_name_active {
            log::debug!("⏳ Task {} ({}) started: {}", id, kind, active);
            trackers.insert(TaskTracker {
                id: id.clone(),
                kind,
                active_label: Some(active.clone()),
                complete_label: part.task_name_complete.clone(),
                state: TaskState::Active,
            });
        }
    }

    if !part.is_finished() {
        return;
    }
    match trackers.get_mut(&id) {
        Some(tracker) if tracker.state == TaskState::Active => {
            tracker.state = TaskState::Complete;
            if let Some(label) = &part.task_name_complete {
                tracker.complete_label = Some(label.clone());
            }
            log::debug!("✅ Task {} completed: {}", id, tracker.label());
        }
        Some(_) => {}
        None => log::debug!("Ignoring task {} finished without being seen active", id),
    }
}

fn diagnostic_facts(part: &ContentPart) -> Vec<DiagnosticFact> {
    let id = part.id.clone().unwrap_or_default();
    part.parts
        .iter()
        .filter_map(|sub| {
            let passed = match sub.kind.as_str() {
                DIAGNOSTICS_PASSED => true,
                DIAGNOSTICS_FAILED => false,
                _ => return None,
            };
            let label = part
                .task_name_complete
                .clone()
                .or_else(|| part.title.clone())
                .unwrap_or_else(|| {
                    if passed {
                        "No issues found".to_string()
                    } else {
                        "Issues found".to_string()
                    }
                });
            Some(DiagnosticFact {
                id: id.clone(),
                passed,
                label,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::str::FromStr;

    fn tree(parts: Vec<Value>) -> DocumentTree {
        let elements: Vec<Value> = parts
            .into_iter()
            .map(|p| json!(["AssistantMessageContentPart", {"part": p}]))
            .collect();
        DocumentTree::from_wire(&json!([[0, elements]]))
    }

    #[test]
    fn test_task_goes_active_then_complete() {
        let mut trackers = TaskTrackers::new();

        let info = extract(
            &tree(vec![json!({"type": "task-search-repo-v1", "id": "s1", "taskNameActive": "Searching repo"})]),
            &mut trackers,
        );
        assert_eq!(info.tasks.len(), 1);
        assert_eq!(info.tasks[0].state, TaskState::Active);
        assert_eq!(info.tasks[0].label(), "Searching repo");

        let info = extract(
            &tree(vec![json!({
                "type": "task-search-repo-v1", "id": "s1",
                "taskNameActive": "Searching repo", "taskNameComplete": "Searched repo",
                "finishedAt": 1700000000
            })]),
            &mut trackers,
        );
        assert_eq!(info.tasks[0].state, TaskState::Complete);
        assert_eq!(info.tasks[0].label(), "Searched repo");
    }

    #[test]
    fn test_complete_label_falls_back_to_active() {
        let mut trackers = TaskTrackers::new();
        extract(
            &tree(vec![json!({"type": "task-coding-v1", "id": "c1", "taskNameActive": "Writing code"})]),
            &mut trackers,
        );
        let info = extract(
            &tree(vec![json!({"type": "task-coding-v1", "id": "c1", "finishedAt": "2024-01-01T00:00:00Z"})]),
            &mut trackers,
        );
        assert_eq!(info.tasks[0].state, TaskState::Complete);
        assert_eq!(info.tasks[0].label(), "Writing code");
    }

    #[test]
    fn test_finished_without_active_is_dropped() {
        let mut trackers = TaskTrackers::new();
        let info = extract(
            &tree(vec![json!({"type": "task-coding-v1", "id": "c9", "finishedAt": 1})]),
            &mut trackers,
        );
        assert!(info.tasks.is_empty());
        assert!(trackers.is_empty());
    }

    #[test]
    fn test_complete_never_regresses() {
        let mut trackers = TaskTrackers::new();
        let active = json!({"type": "task-coding-v1", "id": "c1", "taskNameActive": "Coding"});
        let done = json!({"type": "task-coding-v1", "id": "c1", "taskNameActive": "Coding", "finishedAt": 1});

        let mut states = Vec::new();
        for part in [active.clone(), done, active] {
            let info = extract(&tree(vec![part]), &mut trackers);
            states.push(info.tasks[0].state);
        }
        assert!(states.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(states.last(), Some(&TaskState::Complete));
    }

    #[test]
    fn test_thinking_fact_requires_finish_and_duration() {
        let mut trackers = TaskTrackers::new();
        let unfinished = tree(vec![json!({
            "type": "task-thinking-v1", "parts": [{"type": "thinking-end", "duration": 4.6}]
        })]);
        assert_eq!(extract(&unfinished, &mut trackers).thinking, None);

        let finished = tree(vec![json!({
            "type": "task-thinking-v1", "finishedAt": 1,
            "parts": [{"type": "thinking-start"}, {"type": "thinking-end", "duration": 4.6}]
        })]);
        let fact = extract(&finished, &mut trackers).thinking.unwrap();
        assert_eq!(fact.duration_secs, 5);
        // stateless: reported again on the next call
        assert!(extract(&finished, &mut trackers).thinking.is_some());
    }

    #[test]
    fn test_diagnostics_are_reported_every_call() {
        let mut trackers = TaskTrackers::new();
        let doc = tree(vec![json!({
            "type": "task-diagnostics-v1", "id": "d1", "title": "Type check",
            "parts": [{"type": "diagnostics-failed"}]
        })]);
        let first = extract(&doc, &mut trackers).diagnostics;
        let second = extract(&doc, &mut trackers).diagnostics;
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert!(!first[0].passed);
        assert_eq!(first[0].status_line(), "\n⚠️ Type check");
    }

    #[test]
    fn test_trackers_keep_first_seen_order() {
        let mut trackers = TaskTrackers::new();
        let info = extract(
            &tree(vec![
                json!({"type": "task-coding-v1", "id": "b", "taskNameActive": "B"}),
                json!({"type": "task-search-web-v1", "id": "a", "taskNameActive": "A"}),
            ]),
            &mut trackers,
        );
        let ids: Vec<&str> = info.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(info.tasks[1].kind, TaskKind::Search);
    }

    #[test]
    fn test_task_with_numeric_id_is_tracked() {
        let mut trackers = TaskTrackers::new();
        extract(
            &tree(vec![json!({"type": "task-search-web-v1", "id": 12, "title": false, "taskNameActive": "Searching"})]),
            &mut trackers,
        );
        let info = extract(
            &tree(vec![json!({"type": "task-search-web-v1", "id": 12, "finishedAt": 1})]),
            &mut trackers,
        );
        assert_eq!(info.tasks.len(), 1);
        assert_eq!(info.tasks[0].id, "12");
        assert_eq!(info.tasks[0].state, TaskState::Complete);
    }

    #[test]
    fn test_kind_and_state_names() {
        assert_eq!(TaskKind::from_str("diagnostics").unwrap(), TaskKind::Diagnostics);
        assert_eq!(TaskState::Complete.to_string(), "complete");
        assert_eq!(TaskKind::from_part_type("task-unknown-v1"), None);
    }
}
