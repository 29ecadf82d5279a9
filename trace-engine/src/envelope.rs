//! Raw envelope parsing.
//!
//! Turns the JSON envelopes delivered by the push subscription or the socket
//! into [`TraceFragment`]s. Only the fields needed to find the agent, the step
//! kind and the text payload are read; everything else is ignored.

use serde_json::Value;
use shared_types::{StepKind, TraceFragment};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("Malformed envelope JSON: {0}")]
    MalformedJson(String),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Malformed trace JSON: {0}")]
    MalformedTrace(String),
}

/// Label used when a trace shape implies the routing classifier.
pub const ROUTING_CLASSIFIER_LABEL: &str = "ROUTING_CLASSIFIER";
/// Label used when a trace shape implies the supervisor.
pub const SUPERVISOR_LABEL: &str = "Supervisor";

/// Parse envelope text as received from a socket frame.
pub fn parse_envelope_text(text: &str, now_ms: i64) -> Result<Vec<TraceFragment>, EnvelopeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;
    parse_envelope(&value, now_ms)
}

/// Extract every fragment carried by one envelope.
///
/// Either all fragments are returned or the envelope is rejected as a whole.
pub fn parse_envelope(envelope: &Value, now_ms: i64) -> Result<Vec<TraceFragment>, EnvelopeError> {
    if !envelope.is_object() {
        return Err(EnvelopeError::NotAnObject);
    }

    let timestamp = envelope_timestamp(envelope).unwrap_or(now_ms);
    let session_id = str_at(envelope, &["sessionId"]).map(ToString::to_string);
    let mut fragments = Vec::new();

    if let Some(trace_payload) = extract_trace_payload(envelope)? {
        let mut fragment = fragment_from_trace(&trace_payload, timestamp);
        if bool_at(envelope, &["onUpdateChat", "isComplete"]) {
            fragment.explicit_complete = true;
        }
        if fragment.session_id.is_none() {
            fragment.session_id = session_id.clone();
        }
        fragments.push(fragment);
    }

    if let Some(text) = str_at(envelope, &["onUpdateChat", "assistant"]).filter(|t| !t.is_empty())
    {
        let mut fragment = TraceFragment::new(
            SUPERVISOR_LABEL,
            StepKind::FinalResponse,
            Value::String(text.to_string()),
            timestamp,
        );
        fragment.explicit_complete = bool_at(envelope, &["onUpdateChat", "isComplete"]);
        fragment.session_id = session_id;
        fragments.push(fragment);
    }

    Ok(fragments)
}

/// Locate the trace payload inside an envelope, decoding JSON text if needed.
pub fn extract_trace_payload(envelope: &Value) -> Result<Option<Value>, EnvelopeError> {
    if let Some(trace) = value_at(envelope, &["onUpdateChat", "trace"]) {
        return decode_trace(trace).map(Some);
    }

    if let Some(content) = envelope.get("content").filter(|c| c.get("trace").is_some()) {
        let mut content = content.clone();
        if let Some(obj) = content.as_object_mut() {
            if let Some(trace) = obj.get("trace") {
                let decoded = decode_trace(trace)?;
                obj.insert("trace".to_string(), decoded);
            }
        }
        return Ok(Some(content));
    }

    if envelope.get("collaboratorName").is_some() || envelope.get("agentName").is_some() {
        return Ok(Some(envelope.clone()));
    }

    Ok(None)
}

fn decode_trace(trace: &Value) -> Result<Value, EnvelopeError> {
    match trace {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| EnvelopeError::MalformedTrace(e.to_string())),
        Value::Null => Err(EnvelopeError::MalformedTrace("trace is null".to_string())),
        other => Ok(other.clone()),
    }
}

/// Build a fragment from a decoded trace payload.
pub fn fragment_from_trace(payload: &Value, timestamp: i64) -> TraceFragment {
    let inner = payload
        .get("trace")
        .filter(|t| t.is_object())
        .unwrap_or(payload);
    let routing = inner.get("routingClassifierTrace");
    let orchestration = inner.get("orchestrationTrace");

    let identifier = agent_identifier(payload, inner, routing, orchestration);
    let (step_kind, step_payload) = match orchestration.or(routing) {
        Some(step) => classify_step(step),
        None => (StepKind::Unknown, inner.clone()),
    };

    let mut fragment = TraceFragment::new(identifier, step_kind, step_payload, timestamp)
        .with_raw(payload.clone());
    fragment.explicit_complete =
        bool_at(payload, &["explicitComplete"]) || bool_at(payload, &["isComplete"]);
    fragment.title = str_at(payload, &["title"]).map(ToString::to_string);
    fragment.step_number = payload
        .get("stepNumber")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());
    fragment.session_id = str_at(payload, &["sessionId"]).map(ToString::to_string);
    fragment
}

fn agent_identifier(
    payload: &Value,
    inner: &Value,
    routing: Option<&Value>,
    orchestration: Option<&Value>,
) -> String {
    if routing.is_some() {
        return ROUTING_CLASSIFIER_LABEL.to_string();
    }

    let named = orchestration
        .and_then(|o| {
            str_at(
                o,
                &[
                    "invocationInput",
                    "agentCollaboratorInvocationInput",
                    "agentCollaboratorName",
                ],
            )
        })
        .or_else(|| str_at(payload, &["collaboratorName"]))
        .or_else(|| str_at(inner, &["collaboratorName"]))
        .or_else(|| str_at(payload, &["agentName"]))
        .or_else(|| str_at(inner, &["agentName"]))
        .filter(|name| !name.trim().is_empty());
    if let Some(name) = named {
        return name.to_string();
    }

    let implies_supervisor = orchestration.is_some_and(|o| {
        o.get("rationale").is_some() || value_at(o, &["observation", "finalResponse"]).is_some()
    });
    if implies_supervisor {
        SUPERVISOR_LABEL.to_string()
    } else {
        String::new()
    }
}

/// Determine the step kind and its text payload from an orchestration or
/// routing-classifier trace object.
pub fn classify_step(step: &Value) -> (StepKind, Value) {
    if let Some(rationale) = step.get("rationale") {
        return (StepKind::Rationale, text_or_whole(rationale));
    }

    if let Some(observation) = step.get("observation") {
        if let Some(final_response) = observation.get("finalResponse") {
            return (StepKind::FinalResponse, text_or_whole(final_response));
        }
        if let Some(kb) = observation.get("knowledgeBaseLookupOutput") {
            let references = kb.get("retrievedReferences").cloned();
            return (
                StepKind::KnowledgeBaseResult,
                references.unwrap_or_else(|| kb.clone()),
            );
        }
        if let Some(action) = observation.get("actionGroupInvocationOutput") {
            return (StepKind::ActionGroupOutput, text_or_whole(action));
        }
    }

    if let Some(input) = step.get("invocationInput") {
        if let Some(kb) = input.get("knowledgeBaseLookupInput") {
            return (StepKind::KnowledgeBaseQuery, text_or_whole(kb));
        }
        if let Some(action) = input.get("actionGroupInvocationInput") {
            return (StepKind::ActionGroupInput, action.clone());
        }
    }

    if let Some(model_input) = step.get("modelInvocationInput") {
        return (StepKind::ModelInput, text_or_whole(model_input));
    }

    if let Some(model_output) = step.get("modelInvocationOutput") {
        let content = value_at(model_output, &["rawResponse", "content"])
            .or_else(|| model_output.get("parsedResponse"))
            .cloned()
            .unwrap_or_else(|| model_output.clone());
        return (StepKind::ModelOutput, content);
    }

    (StepKind::Unknown, step.clone())
}

fn text_or_whole(value: &Value) -> Value {
    match value.get("text") {
        Some(Value::String(text)) => Value::String(text.clone()),
        _ => value.clone(),
    }
}

fn envelope_timestamp(envelope: &Value) -> Option<i64> {
    if let Some(ms) = envelope.get("timestamp").and_then(Value::as_i64) {
        return Some(ms);
    }
    let event_time = value_at(envelope, &["onUpdateChat", "trace", "eventTime"])
        .or_else(|| value_at(envelope, &["content", "trace", "eventTime"]))
        .and_then(Value::as_str)?;
    chrono::DateTime::parse_from_rfc3339(event_time)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .filter(|v| !v.is_null())
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    value_at(value, path).and_then(Value::as_str)
}

fn bool_at(value: &Value, path: &[&str]) -> bool {
    value_at(value, path)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
