//! Trace merging.
//!
//! A fragment becomes a [`Task`] (and, for paired input/output steps, a
//! [`SubTask`]) inside the [`TraceGroup`] of the node it resolves to. Tasks and
//! subtasks are matched by their title with timing annotations stripped, so a
//! resend of "Step 1 (1.2 seconds)" as "Step 1 (3.4 seconds)" lands on the same
//! task. Content already present is never overwritten, with one exception: a
//! final response is streamed as the full text so far, so a resend that
//! strictly extends the stored text replaces it.
//!
//! Untitled steps that carry an orchestration step number are keyed by that
//! number as well, so a second model call does not land on the first.
//!
//! Merging is idempotent: applying a fragment that changes nothing leaves the
//! group untouched, including `last_update_time`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use shared_types::{AgentNodeId, StepKind, SubTask, Task, TraceFragment, TraceGroup};

use crate::config::DEFAULT_COMPLETION_LENGTH_THRESHOLD;
use crate::identity;

static TIMING_ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\(\s*\d+(?:\.\d+)?\s*(?:seconds?|secs?|s|steps?)\s*\)")
        .expect("timing annotation pattern is valid")
});

static LEADING_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Step\s+(\d+)(?:\s|$|[-:(])").expect("leading step pattern is valid")
});

static STEP_ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Step\s+(\d+)\.(\d+)").expect("step ordinal pattern is valid"));

/// Lower-cased phrases that mark a final response as finished.
pub const TERMINAL_PHRASES: [&str; 4] = [
    "is there anything else",
    "can i help you with anything else",
    "in conclusion",
    "to summarize",
];

pub const FINAL_RESPONSE_LABEL: &str = "Final Response";
pub const RATIONALE_LABEL: &str = "Rationale";

/// Strip timing annotations such as "(12.3 seconds)", "(3 steps)" or "(1.2s)".
pub fn normalize_title(title: &str) -> String {
    let stripped = TIMING_ANNOTATION.replace_all(title, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Embedded "Step N.M" ordinal of a subtask title.
pub fn step_ordinal(title: &str) -> Option<(u32, u32)> {
    let caps = STEP_ORDINAL.captures(title)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    Some((major, minor))
}

fn leading_step_number(title: &str) -> Option<u32> {
    LEADING_STEP
        .captures(title)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn content_is_empty(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Task and subtask labels derived from a step kind.
fn step_labels(kind: StepKind) -> (&'static str, Option<(&'static str, u32)>) {
    match kind {
        StepKind::ModelInput => ("Invoking Model", Some(("Model Input", 1))),
        StepKind::ModelOutput => ("Invoking Model", Some(("Model Output", 2))),
        StepKind::KnowledgeBaseQuery => ("Knowledge Base", Some(("Knowledge Base Query", 1))),
        StepKind::KnowledgeBaseResult => ("Knowledge Base", Some(("Knowledge Base Results", 2))),
        StepKind::ActionGroupInput => ("Action Group", Some(("Action Group Input", 1))),
        StepKind::ActionGroupOutput => ("Action Group", Some(("Action Group Output", 2))),
        StepKind::Rationale => (RATIONALE_LABEL, None),
        StepKind::FinalResponse => (FINAL_RESPONSE_LABEL, None),
        StepKind::Unknown => ("Trace", None),
    }
}

fn elapsed_seconds(start: i64, timestamp: i64) -> f64 {
    timestamp.saturating_sub(start).max(0) as f64 / 1000.0
}

/// Incoming final-response text that continues the stored text.
fn extends_text(stored: &Value, incoming: &Value) -> bool {
    match (stored, incoming) {
        (Value::String(stored), Value::String(incoming)) => {
            incoming.len() > stored.len() && incoming.starts_with(stored.as_str())
        }
        _ => false,
    }
}

/// Best-effort completion detection. Upstream never sends an authoritative
/// "done" signal, so this can misfire in both directions.
#[derive(Debug, Clone)]
pub struct CompletionHeuristic {
    pub length_threshold: usize,
}

impl Default for CompletionHeuristic {
    fn default() -> Self {
        Self {
            length_threshold: DEFAULT_COMPLETION_LENGTH_THRESHOLD,
        }
    }
}

impl CompletionHeuristic {
    pub fn is_complete(&self, group: &TraceGroup, fragment: &TraceFragment) -> bool {
        if fragment.explicit_complete {
            return true;
        }
        let text = accumulated_final_response(group);
        if text.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        TERMINAL_PHRASES.iter().any(|phrase| lowered.contains(phrase))
            || text.chars().count() > self.length_threshold
    }
}

/// Concatenated text of every final-response task in the group.
pub fn accumulated_final_response(group: &TraceGroup) -> String {
    group
        .tasks
        .iter()
        .filter(|task| is_final_response_title(&task.title))
        .map(|task| content_text(&task.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn is_final_response_title(title: &str) -> bool {
    title.to_lowercase().contains("final response")
}

/// Result of merging one fragment.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub node_id: AgentNodeId,
    pub group: TraceGroup,
    pub created: bool,
    pub changed: bool,
    /// The fragment flipped the group to complete
    pub completed_now: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TraceMerger {
    completion: CompletionHeuristic,
}

impl TraceMerger {
    pub fn new(completion: CompletionHeuristic) -> Self {
        Self { completion }
    }

    /// Node a fragment belongs to.
    pub fn node_for(&self, fragment: &TraceFragment) -> AgentNodeId {
        identity::resolve(&fragment.agent_identifier)
    }

    /// Merge a fragment into the node's current group, creating the group when
    /// the node has none yet.
    pub fn merge(
        &self,
        existing: Option<TraceGroup>,
        fragment: &TraceFragment,
        now_ms: i64,
    ) -> MergeOutcome {
        let node_id = self.node_for(fragment);
        let (mut group, created) = match existing {
            Some(group) if group.agent_id == node_id => (group, false),
            _ => (
                TraceGroup::new(node_id, fragment.agent_identifier.clone(), now_ms),
                true,
            ),
        };
        let was_complete = group.is_complete;
        let changed = self.merge_into(&mut group, fragment) || created;

        MergeOutcome {
            node_id,
            completed_now: !was_complete && group.is_complete,
            group,
            created,
            changed,
        }
    }

    /// Apply a fragment to a group in place. Returns whether anything changed.
    pub fn merge_into(&self, group: &mut TraceGroup, fragment: &TraceFragment) -> bool {
        let before = group.clone();

        if !fragment.agent_identifier.is_empty()
            && group.original_agent_type != fragment.agent_identifier
        {
            group.original_agent_type = fragment.agent_identifier.clone();
        }

        self.merge_task(group, fragment);

        let completing = !group.is_complete && self.completion.is_complete(group, fragment);
        if completing {
            group.is_complete = true;
        }

        let changed = *group != before;
        if changed {
            group.last_update_time = fragment
                .timestamp
                .max(before.last_update_time.saturating_add(1));
        }
        if completing {
            let elapsed = elapsed_seconds(group.start_time, group.last_update_time);
            group.final_elapsed_time = Some(format!("{elapsed:.2}"));
        }
        changed
    }

    fn merge_task(&self, group: &mut TraceGroup, fragment: &TraceFragment) {
        let (task_label, sub_label) = match &fragment.title {
            Some(title) => (title.as_str(), None),
            None => step_labels(fragment.step_kind),
        };
        let key = normalize_title(task_label);
        let elapsed = elapsed_seconds(group.start_time, fragment.timestamp);
        // Untitled steps from different orchestration steps stay apart.
        let step_filter = fragment.title.is_none().then_some(fragment.step_number).flatten();

        let index = match group.tasks.iter().position(|task| {
            normalize_title(&task.title) == key
                && step_filter.map_or(true, |n| task.step_number == n)
        }) {
            Some(index) => {
                let task = &mut group.tasks[index];
                if sub_label.is_none() && !content_is_empty(&fragment.payload) {
                    let fill = content_is_empty(&task.content)
                        || (is_final_response_title(&task.title)
                            && extends_text(&task.content, &fragment.payload));
                    if fill {
                        task.content = fragment.payload.clone();
                    }
                }
                if task.raw_payload.is_none() && fragment.raw.is_some() {
                    task.raw_payload = fragment.raw.clone();
                }
                index
            }
            None => {
                let step_number = fragment
                    .step_number
                    .or_else(|| fragment.title.as_deref().and_then(leading_step_number))
                    .unwrap_or_else(|| next_step_number(group));
                let title = match &fragment.title {
                    Some(title) => title.clone(),
                    None => format!("{task_label} ({elapsed:.2} seconds)"),
                };
                let content = if sub_label.is_some() {
                    Value::Null
                } else {
                    fragment.payload.clone()
                };
                group.tasks.push(Task {
                    step_number,
                    title,
                    content,
                    raw_payload: fragment.raw.clone(),
                    timestamp: fragment.timestamp,
                    sub_tasks: Vec::new(),
                });
                group.tasks.len() - 1
            }
        };

        if let Some((label, ordinal)) = sub_label {
            let task = &mut group.tasks[index];
            let sub_title = format!(
                "Step {}.{} - {} ({:.2} seconds)",
                task.step_number, ordinal, label, elapsed
            );
            merge_sub_task(
                &mut task.sub_tasks,
                SubTask {
                    title: sub_title,
                    content: fragment.payload.clone(),
                    timestamp: fragment.timestamp,
                },
            );
        }
    }
}

fn next_step_number(group: &TraceGroup) -> u32 {
    group
        .tasks
        .iter()
        .map(|task| task.step_number)
        .max()
        .unwrap_or(0)
        + 1
}

/// Merge one subtask by normalized title, then order by embedded step ordinal.
pub fn merge_sub_task(sub_tasks: &mut Vec<SubTask>, incoming: SubTask) {
    let key = normalize_title(&incoming.title);
    match sub_tasks
        .iter_mut()
        .find(|existing| normalize_title(&existing.title) == key)
    {
        Some(existing) => {
            if content_is_empty(&existing.content) && !content_is_empty(&incoming.content) {
                existing.content = incoming.content;
            }
        }
        None => sub_tasks.push(incoming),
    }
    // Stable: titles without an ordinal keep their relative order at the end.
    sub_tasks.sort_by_key(|sub| step_ordinal(&sub.title).unwrap_or((u32::MAX, u32::MAX)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn merger() -> TraceMerger {
        TraceMerger::default()
    }

    fn fragment(label: &str, kind: StepKind, payload: Value, ts: i64) -> TraceFragment {
        TraceFragment::new(label, kind, payload, ts)
    }

    #[test]
    fn test_normalize_title_strips_timing() {
        assert_eq!(normalize_title("Step 1 (1.2s)"), "Step 1");
        assert_eq!(normalize_title("Step 1 (3.4s)"), "Step 1");
        assert_eq!(
            normalize_title("Invoking Model (12.3 seconds)"),
            "Invoking Model"
        );
        assert_eq!(normalize_title("Supervisor (3 steps)"), "Supervisor");
        assert_eq!(normalize_title("Case Preserved (1 step)"), "Case Preserved");
        assert_eq!(normalize_title("Plain"), "Plain");
    }

    #[test]
    fn test_step_ordinal() {
        assert_eq!(step_ordinal("Step 2.1 - Model Input"), Some((2, 1)));
        assert_eq!(step_ordinal("Step 1.10 - X"), Some((1, 10)));
        assert_eq!(step_ordinal("Model Input"), None);
    }

    #[test]
    fn test_new_group_for_first_fragment() {
        let f = fragment("Troubleshoot", StepKind::Rationale, json!("thinking"), 1_500);
        let outcome = merger().merge(None, &f, 1_000);
        assert!(outcome.created);
        assert_eq!(outcome.node_id, AgentNodeId::Troubleshoot);
        assert_eq!(outcome.group.start_time, 1_000);
        assert_eq!(outcome.group.tasks.len(), 1);
        assert_eq!(outcome.group.tasks[0].step_number, 1);
        assert_eq!(outcome.group.tasks[0].title, "Rationale (0.50 seconds)");
        assert!(!outcome.group.is_complete);
    }

    #[test]
    fn test_title_dedup_keeps_first_payload() {
        let m = merger();
        let first = fragment("OrderManagement", StepKind::Unknown, json!("first"), 10)
            .with_title("Step 1 (1.2s)");
        let second = fragment("OrderManagement", StepKind::Unknown, json!("second"), 20)
            .with_title("Step 1 (3.4s)");

        let outcome = m.merge(None, &first, 0);
        let outcome = m.merge(Some(outcome.group), &second, 0);

        assert_eq!(outcome.group.tasks.len(), 1);
        assert_eq!(outcome.group.tasks[0].content, json!("first"));
        assert_eq!(outcome.group.tasks[0].title, "Step 1 (1.2s)");
        assert_eq!(outcome.group.tasks[0].step_number, 1);
    }

    #[test]
    fn test_empty_content_is_filled_by_later_resend() {
        let m = merger();
        let empty = fragment("OrderManagement", StepKind::Unknown, json!(""), 10)
            .with_title("Step 1 (1.2s)");
        let full = fragment("OrderManagement", StepKind::Unknown, json!("late"), 20)
            .with_title("Step 1 (3.4s)");

        let outcome = m.merge(None, &empty, 0);
        let outcome = m.merge(Some(outcome.group), &full, 0);
        assert_eq!(outcome.group.tasks[0].content, json!("late"));
        assert!(outcome.changed);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let m = merger();
        let fragments = [
            fragment("Troubleshoot", StepKind::ModelInput, json!("prompt"), 100),
            fragment("Troubleshoot", StepKind::ModelOutput, json!("answer"), 200),
            fragment("Troubleshoot", StepKind::FinalResponse, json!("Done. Is there anything else?"), 300),
            fragment("Troubleshoot", StepKind::Unknown, json!({}), 400).with_title("Step 9 (1s)"),
        ];

        let mut group = TraceGroup::new(AgentNodeId::Troubleshoot, "Troubleshoot", 0);
        for f in &fragments {
            m.merge_into(&mut group, f);
            let once = group.clone();
            let changed = m.merge_into(&mut group, f);
            assert!(!changed);
            assert_eq!(group, once);
            assert_eq!(
                serde_json::to_string(&group).unwrap(),
                serde_json::to_string(&once).unwrap()
            );
        }
    }

    #[test]
    fn test_streamed_final_response_extends_stored_text() {
        let m = merger();
        let partial = fragment("Supervisor", StepKind::FinalResponse, json!("Let me look that up."), 10);
        let full = fragment(
            "Supervisor",
            StepKind::FinalResponse,
            json!("Let me look that up. Your order shipped. Is there anything else I can help with?"),
            20,
        );

        let outcome = m.merge(None, &partial, 0);
        assert!(!outcome.group.is_complete);
        let outcome = m.merge(Some(outcome.group), &full, 0);
        assert!(outcome.changed);
        assert!(outcome.completed_now);
        assert_eq!(outcome.group.tasks.len(), 1);
        assert_eq!(outcome.group.tasks[0].content, full.payload);

        // Truncated or unrelated resends never replace the stored text.
        let mut group = outcome.group;
        for text in ["Let me look that up.", "Something else entirely, much longer than before."] {
            let resend = fragment("Supervisor", StepKind::FinalResponse, json!(text), 30);
            assert!(!m.merge_into(&mut group, &resend));
            assert_eq!(group.tasks[0].content, full.payload);
        }
    }

    #[test]
    fn test_final_response_reaches_length_threshold_across_resends() {
        let m = merger();
        let head = "a".repeat(300);
        let mut group = TraceGroup::new(AgentNodeId::Troubleshoot, "Troubleshoot", 0);
        m.merge_into(&mut group, &fragment("Troubleshoot", StepKind::FinalResponse, json!(head.clone()), 1));
        assert!(!group.is_complete);

        let longer = format!("{head}{}", "b".repeat(300));
        assert!(m.merge_into(
            &mut group,
            &fragment("Troubleshoot", StepKind::FinalResponse, json!(longer), 2),
        ));
        assert!(group.is_complete);
    }

    #[test]
    fn test_untitled_steps_split_by_step_number() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::OrderMgmt, "OrderManagement", 0);
        let first = fragment("OrderManagement", StepKind::ModelInput, json!("first prompt"), 1)
            .with_step_number(1);
        let second = fragment("OrderManagement", StepKind::ModelInput, json!("second prompt"), 2)
            .with_step_number(2);

        m.merge_into(&mut group, &first);
        m.merge_into(&mut group, &second);
        assert_eq!(group.tasks.len(), 2);
        assert_eq!(group.tasks[1].step_number, 2);
        assert_eq!(group.tasks[1].sub_tasks[0].content, json!("second prompt"));
        assert!(group.tasks[1].sub_tasks[0].title.starts_with("Step 2.1 - Model Input"));

        // Same step again still lands on its own task.
        assert!(!m.merge_into(&mut group, &second));
        assert_eq!(group.tasks.len(), 2);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 1_000);
        let early = fragment("Supervisor", StepKind::Rationale, json!("r"), i64::MIN);
        assert!(m.merge_into(&mut group, &early));
        assert_eq!(group.tasks[0].title, "Rationale (0.00 seconds)");

        let late = fragment("Supervisor", StepKind::FinalResponse, json!("Done."), i64::MAX).completed();
        assert!(m.merge_into(&mut group, &late));
        assert_eq!(group.last_update_time, i64::MAX);
        assert!(group.final_elapsed_time.is_some());

        let again = fragment("Supervisor", StepKind::ModelInput, json!("p"), 5);
        assert!(m.merge_into(&mut group, &again));
        assert_eq!(group.last_update_time, i64::MAX);
    }

    #[test]
    fn test_paired_steps_share_a_task() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::OrderMgmt, "OrderManagement", 0);
        m.merge_into(
            &mut group,
            &fragment("OrderManagement", StepKind::ModelOutput, json!("out"), 2_000),
        );
        m.merge_into(
            &mut group,
            &fragment("OrderManagement", StepKind::ModelInput, json!("in"), 3_000),
        );

        assert_eq!(group.tasks.len(), 1);
        let task = &group.tasks[0];
        assert!(task.title.starts_with("Invoking Model"));
        assert_eq!(task.sub_tasks.len(), 2);
        // input sorted ahead of output by its embedded ordinal
        assert!(task.sub_tasks[0].title.starts_with("Step 1.1 - Model Input"));
        assert!(task.sub_tasks[1].title.starts_with("Step 1.2 - Model Output"));
    }

    #[test]
    fn test_sub_tasks_sort_with_unmatched_last() {
        let mut subs = vec![
            SubTask { title: "free text b".into(), content: json!("b"), timestamp: 1 },
            SubTask { title: "Step 1.3 - C".into(), content: json!("c"), timestamp: 2 },
            SubTask { title: "free text a".into(), content: json!("a"), timestamp: 3 },
        ];
        merge_sub_task(
            &mut subs,
            SubTask { title: "Step 1.1 - A (0.5 seconds)".into(), content: json!("x"), timestamp: 4 },
        );
        let titles: Vec<_> = subs.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Step 1.1 - A (0.5 seconds)", "Step 1.3 - C", "free text b", "free text a"]
        );
    }

    #[test]
    fn test_sub_task_dedup_ignores_timing() {
        let mut subs = Vec::new();
        merge_sub_task(
            &mut subs,
            SubTask { title: "Step 1.1 - A (0.5 seconds)".into(), content: json!(""), timestamp: 1 },
        );
        merge_sub_task(
            &mut subs,
            SubTask { title: "Step 1.1 - A (0.9 seconds)".into(), content: json!("filled"), timestamp: 2 },
        );
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].content, json!("filled"));
    }

    #[test]
    fn test_step_numbers() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 0);
        m.merge_into(&mut group, &fragment("Supervisor", StepKind::Rationale, json!("r"), 1));
        m.merge_into(
            &mut group,
            &fragment("Supervisor", StepKind::Unknown, json!("x"), 2).with_title("Step 7 - Lookup"),
        );
        m.merge_into(
            &mut group,
            &fragment("Supervisor", StepKind::Unknown, json!("y"), 3)
                .with_title("Custom")
                .with_step_number(3),
        );
        m.merge_into(&mut group, &fragment("Supervisor", StepKind::FinalResponse, json!("f"), 4));

        let numbers: Vec<_> = group.tasks.iter().map(|t| t.step_number).collect();
        assert_eq!(numbers, vec![1, 7, 3, 8]);
    }

    #[test]
    fn test_completion_by_length() {
        let m = merger();
        let text = "x".repeat(600);
        let outcome = m.merge(
            None,
            &fragment("Troubleshoot", StepKind::FinalResponse, json!(text), 2_000),
            1_000,
        );
        assert!(outcome.group.is_complete);
        assert!(outcome.completed_now);
        assert_eq!(outcome.group.final_elapsed_time.as_deref(), Some("1.00"));
    }

    #[test]
    fn test_completion_by_phrase_and_flag() {
        let m = merger();
        let phrase = m.merge(
            None,
            &fragment("Supervisor", StepKind::FinalResponse, json!("In conclusion, yes."), 5),
            0,
        );
        assert!(phrase.group.is_complete);

        let short = m.merge(
            None,
            &fragment("Supervisor", StepKind::FinalResponse, json!("Working on it"), 5),
            0,
        );
        assert!(!short.group.is_complete);

        let flagged = m.merge(
            None,
            &fragment("Supervisor", StepKind::ModelInput, json!("p"), 5).completed(),
            0,
        );
        assert!(flagged.group.is_complete);
    }

    #[test]
    fn test_long_non_final_text_does_not_complete() {
        let m = merger();
        let outcome = m.merge(
            None,
            &fragment("Supervisor", StepKind::ModelInput, json!("y".repeat(900)), 5),
            0,
        );
        assert!(!outcome.group.is_complete);
    }

    #[test]
    fn test_completion_is_monotonic() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 0);
        m.merge_into(
            &mut group,
            &fragment("Supervisor", StepKind::ModelInput, json!("p"), 1).completed(),
        );
        assert!(group.is_complete);

        for (i, kind) in [StepKind::ModelOutput, StepKind::Rationale, StepKind::Unknown]
            .into_iter()
            .enumerate()
        {
            m.merge_into(&mut group, &fragment("Supervisor", kind, json!("more"), 10 + i as i64));
            assert!(group.is_complete);
        }
    }

    #[test]
    fn test_last_update_time_advances_on_change_only() {
        let m = merger();
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 100);
        // older timestamp still moves the clock forward
        m.merge_into(&mut group, &fragment("Supervisor", StepKind::Rationale, json!("r"), 50));
        assert_eq!(group.last_update_time, 101);

        m.merge_into(&mut group, &fragment("Supervisor", StepKind::ModelInput, json!("p"), 900));
        assert_eq!(group.last_update_time, 900);

        m.merge_into(&mut group, &fragment("Supervisor", StepKind::ModelInput, json!("p"), 999));
        assert_eq!(group.last_update_time, 900);
    }

    #[test]
    fn test_original_agent_type_tracks_last_label() {
        let m = merger();
        let outcome = m.merge(
            None,
            &fragment("OrderManagement", StepKind::Rationale, json!("a"), 1),
            0,
        );
        let outcome = m.merge(
            Some(outcome.group),
            &fragment("ORDER_MGMT", StepKind::Rationale, json!("a"), 2),
            0,
        );
        assert_eq!(outcome.group.original_agent_type, "ORDER_MGMT");
        assert!(outcome.changed);
    }

    #[test]
    fn test_group_for_other_node_is_not_reused() {
        let m = merger();
        let other = TraceGroup::new(AgentNodeId::ProductRec, "ProductRec", 0);
        let outcome = m.merge(
            Some(other.clone()),
            &fragment("Troubleshoot", StepKind::Rationale, json!("a"), 1),
            5,
        );
        assert!(outcome.created);
        assert_ne!(outcome.group.id, other.id);
    }
}
