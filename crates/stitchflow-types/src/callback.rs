//! Completion-callback wire types.
//!
//! External compute workers report step completion by POSTing this payload
//! to the callback endpoint. There is no auth header: trust derives solely
//! from the HMAC-SHA256 signature over the body, and the timestamp bounds
//! the replay window.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Step outcome reported by an external worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Completed => "completed",
            CallbackStatus::Failed => "failed",
        }
    }
}

/// Completion callback body (wire format camelCase).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCallback {
    /// The run being reported on.
    pub task_id: Uuid,
    /// The step within the run.
    pub step_index: u32,
    /// Terminal outcome of the step.
    pub status: CallbackStatus,
    /// Step output; present on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure message; present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Worker-side send time, epoch milliseconds.
    pub timestamp: i64,
    /// Hex HMAC-SHA256 over the canonical payload string.
    pub signature: String,
}

/// Fixed response shape of the callback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub message: String,
}

impl CallbackResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_callback_wire_format_is_camel_case() {
        let cb = StepCallback {
            task_id: Uuid::nil(),
            step_index: 3,
            status: CallbackStatus::Completed,
            output: Some(json!({ "url": "https://cdn.example/out.png" })),
            error_message: None,
            timestamp: 1_700_000_000_000,
            signature: "ab12".to_string(),
        };
        let json_str = serde_json::to_string(&cb).unwrap();
        assert!(json_str.contains("\"taskId\""));
        assert!(json_str.contains("\"stepIndex\":3"));
        assert!(json_str.contains("\"status\":\"completed\""));
        assert!(!json_str.contains("errorMessage"), "None fields are omitted");
    }

    #[test]
    fn test_callback_parse_failed_status() {
        let json_str = r#"{
            "taskId": "01938e90-0000-7000-8000-000000000001",
            "stepIndex": 0,
            "status": "failed",
            "errorMessage": "GPU worker OOM",
            "timestamp": 1700000000000,
            "signature": "deadbeef"
        }"#;
        let cb: StepCallback = serde_json::from_str(json_str).unwrap();
        assert_eq!(cb.status, CallbackStatus::Failed);
        assert_eq!(cb.error_message.as_deref(), Some("GPU worker OOM"));
        assert!(cb.output.is_none());
    }

    #[test]
    fn test_callback_parse_rejects_missing_required_field() {
        // No signature field.
        let json_str = r#"{
            "taskId": "01938e90-0000-7000-8000-000000000001",
            "stepIndex": 0,
            "status": "completed",
            "timestamp": 1700000000000
        }"#;
        assert!(serde_json::from_str::<StepCallback>(json_str).is_err());
    }

    #[test]
    fn test_callback_response_shapes() {
        let ok = CallbackResponse::ok("step recorded");
        assert!(ok.success);
        let rejected = CallbackResponse::rejected("signature mismatch");
        assert!(!rejected.success);
        let json_str = serde_json::to_string(&rejected).unwrap();
        assert!(json_str.contains("\"success\":false"));
    }
}
