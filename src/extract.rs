//! Structured emergency-report extraction.
//!
//! Both backends produce the same thing over a call's lifetime: a gradually
//! filled [`EmergencyReport`]. The realtime backend delivers it in one shot
//! as a function call; the pipeline backend accumulates it turn by turn from
//! the dialogue model's trailing `VOICE_EXTRACTION:` marker line.

use serde::{Deserialize, Serialize};

/// Marker the dialogue model appends after its spoken reply.
pub const EXTRACTION_MARKER: &str = "VOICE_EXTRACTION:";

/// Accepted emergency categories.
pub const CATEGORIES: [&str; 6] = ["fuel", "medical", "shelter", "food_water", "rescue", "other"];

/// Partial (eventually complete) extraction of the caller's emergency.
/// Every field is null until the caller provides it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReport {
    pub full_name: Option<String>,
    pub social_security_number: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub emergency_description: Option<String>,
    pub category: Option<String>,
    pub severity: Option<i64>,
}

impl EmergencyReport {
    /// Fold a later extraction into this one. Last write wins per field, but
    /// only for non-null values: a later null never clears what the caller
    /// already provided.
    pub fn merge(&mut self, update: EmergencyReport) {
        merge_field(&mut self.full_name, update.full_name);
        merge_field(&mut self.social_security_number, update.social_security_number);
        merge_field(&mut self.location, update.location);
        merge_field(&mut self.latitude, update.latitude);
        merge_field(&mut self.longitude, update.longitude);
        merge_field(&mut self.emergency_description, update.emergency_description);
        merge_field(&mut self.category, update.category);
        merge_field(&mut self.severity, update.severity);
    }

    /// Names of the case-creation fields still missing. The six required
    /// fields are the caller identity, location, description, category, and
    /// severity; coordinates are optional enrichment.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.full_name.is_none() {
            missing.push("full_name");
        }
        if self.social_security_number.is_none() {
            missing.push("social_security_number");
        }
        if self.location.is_none() {
            missing.push("location");
        }
        if self.emergency_description.is_none() {
            missing.push("emergency_description");
        }
        if self.category.is_none() {
            missing.push("category");
        }
        if self.severity.is_none() {
            missing.push("severity");
        }
        missing
    }

    /// True when all six case-creation fields are present.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

fn merge_field<T>(current: &mut Option<T>, update: Option<T>) {
    if update.is_some() {
        *current = update;
    }
}

/// A backend-issued request to create the emergency case.
///
/// Valid only when the report carries all six required fields; an invocation
/// with a missing field is a protocol error the orchestrator logs and
/// ignores, never a partial case.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Correlation id of the backend function call, when the backend has one.
    pub call_id: Option<String>,
    pub report: EmergencyReport,
}

impl ToolInvocation {
    /// Build an invocation from a realtime function call's JSON-encoded
    /// argument string. Unparseable arguments yield an empty (invalid)
    /// report rather than an error.
    pub fn from_function_call(call_id: Option<String>, arguments: &str) -> Self {
        let report = serde_json::from_str(arguments).unwrap_or_default();
        Self { call_id, report }
    }

    pub fn is_valid(&self) -> bool {
        self.report.is_complete()
    }
}

/// Split a dialogue model's raw output into the spoken reply and the
/// extraction JSON that follows the `VOICE_EXTRACTION:` marker.
///
/// Tolerates a missing marker (reply only, empty report), markdown code
/// fences around the JSON, and unparseable JSON (logged by the caller via
/// the empty report).
pub fn parse_reply_and_extraction(raw: &str) -> (String, EmergencyReport) {
    let Some(idx) = raw.find(EXTRACTION_MARKER) else {
        return (raw.trim().to_string(), EmergencyReport::default());
    };
    let reply = raw[..idx].trim().to_string();
    let mut json = raw[idx + EXTRACTION_MARKER.len()..].trim();
    for fence in ["```json", "```"] {
        if let Some(stripped) = json.strip_prefix(fence) {
            json = stripped.trim_start();
            break;
        }
    }
    if let Some(stripped) = json.strip_suffix("```") {
        json = stripped.trim_end();
    }
    let report = serde_json::from_str(json).unwrap_or_default();
    (reply, report)
}
