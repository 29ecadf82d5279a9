//! Display ordering for trace groups handed to the flow view.
//!
//! Never mutates the stored group; [`prepare_for_display`] returns a reordered
//! copy.

use shared_types::{SubTask, Task, TraceGroup};

use crate::merger::{is_final_response_title, RATIONALE_LABEL};

/// Input/output label pairs for tasks whose subtasks read as a request and its
/// answer.
const PAIRED_SUB_TASKS: [(&str, &[&str], &[&str]); 3] = [
    (
        "Knowledge Base",
        &["knowledge base query", "knowledge base input"],
        &["knowledge base results", "knowledge base output"],
    ),
    (
        "Action Group",
        &["action group input"],
        &["action group output", "action group result"],
    ),
    ("Invoking Model", &["model input"], &["model output"]),
];

/// Reorder a group for presentation:
/// - paired subtasks list inputs before outputs, others go by timestamp
/// - processing tasks sort by step number, then timestamp
/// - rationale follows step 1, final responses go last
pub fn prepare_for_display(group: &TraceGroup) -> TraceGroup {
    let mut prepared = group.clone();
    for task in &mut prepared.tasks {
        order_sub_tasks(task);
    }

    let (final_responses, others): (Vec<Task>, Vec<Task>) = prepared
        .tasks
        .into_iter()
        .partition(|task| is_final_response_title(&task.title));
    let (rationale, mut processing): (Vec<Task>, Vec<Task>) = others
        .into_iter()
        .partition(|task| task.title.contains(RATIONALE_LABEL));

    processing.sort_by_key(|task| (task.step_number, task.timestamp));

    let step_one = processing
        .iter()
        .position(|task| task.step_number == 1 || task.title.contains("Step 1:"));

    let mut ordered = Vec::with_capacity(processing.len() + rationale.len() + final_responses.len());
    match step_one {
        Some(index) if !rationale.is_empty() => {
            let rest = processing.split_off(index + 1);
            ordered.extend(processing);
            ordered.extend(rationale);
            ordered.extend(rest);
        }
        _ => {
            ordered.extend(processing);
            ordered.extend(rationale);
        }
    }
    ordered.extend(final_responses);

    prepared.tasks = ordered;
    prepared
}

fn order_sub_tasks(task: &mut Task) {
    if task.sub_tasks.is_empty() {
        return;
    }

    let paired = PAIRED_SUB_TASKS
        .iter()
        .find(|(label, _, _)| task.title.contains(label));

    match paired {
        Some((_, inputs, outputs)) => {
            let rank = |sub: &SubTask| {
                let title = sub.title.to_lowercase();
                if inputs.iter().any(|needle| title.contains(needle)) {
                    0
                } else if outputs.iter().any(|needle| title.contains(needle)) {
                    1
                } else {
                    2
                }
            };
            task.sub_tasks.sort_by_key(rank);
        }
        None => task.sub_tasks.sort_by_key(|sub| sub.timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_types::AgentNodeId;

    fn task(step: u32, title: &str, ts: i64) -> Task {
        Task {
            step_number: step,
            title: title.to_string(),
            content: json!(title),
            raw_payload: None,
            timestamp: ts,
            sub_tasks: Vec::new(),
        }
    }

    fn sub(title: &str, ts: i64) -> SubTask {
        SubTask {
            title: title.to_string(),
            content: json!(null),
            timestamp: ts,
        }
    }

    fn titles(group: &TraceGroup) -> Vec<&str> {
        group.tasks.iter().map(|t| t.title.as_str()).collect()
    }

    #[test]
    fn test_task_order() {
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 0);
        group.tasks = vec![
            task(4, "Final Response (9.00 seconds)", 90),
            task(3, "Step 3 - Lookup", 30),
            task(2, "Rationale (1.00 seconds)", 10),
            task(1, "Invoking Model (0.50 seconds)", 5),
            task(3, "Step 3 - Earlier", 20),
        ];

        let prepared = prepare_for_display(&group);
        assert_eq!(
            titles(&prepared),
            vec![
                "Invoking Model (0.50 seconds)",
                "Rationale (1.00 seconds)",
                "Step 3 - Earlier",
                "Step 3 - Lookup",
                "Final Response (9.00 seconds)",
            ]
        );
        // source group untouched
        assert_eq!(group.tasks[0].title, "Final Response (9.00 seconds)");
    }

    #[test]
    fn test_rationale_without_step_one_goes_after_processing() {
        let mut group = TraceGroup::new(AgentNodeId::Supervisor, "Supervisor", 0);
        group.tasks = vec![
            task(1, "Rationale", 1),
            task(2, "Step 2 - A", 2),
            task(3, "Step 3 - B", 3),
        ];
        let prepared = prepare_for_display(&group);
        assert_eq!(titles(&prepared), vec!["Step 2 - A", "Step 3 - B", "Rationale"]);
    }

    #[test]
    fn test_paired_sub_tasks_inputs_first() {
        let mut group = TraceGroup::new(AgentNodeId::OrderMgmt, "OrderManagement", 0);
        let mut kb = task(1, "Knowledge Base (1.00 seconds)", 1);
        kb.sub_tasks = vec![
            sub("Step 1.2 - Knowledge Base Results", 1),
            sub("note", 2),
            sub("Step 1.1 - Knowledge Base Query", 3),
        ];
        let mut other = task(2, "Step 2 - Misc", 2);
        other.sub_tasks = vec![sub("b", 20), sub("a", 10)];
        group.tasks = vec![kb, other];

        let prepared = prepare_for_display(&group);
        let kb_titles: Vec<_> = prepared.tasks[0].sub_tasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            kb_titles,
            vec![
                "Step 1.1 - Knowledge Base Query",
                "Step 1.2 - Knowledge Base Results",
                "note"
            ]
        );
        let other_titles: Vec<_> = prepared.tasks[1].sub_tasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(other_titles, vec!["a", "b"]);
    }
}
