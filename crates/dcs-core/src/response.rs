use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorType, IpcError};

/// Reply to a single command. Three wire shapes share this struct:
/// `{"success":true}`, `{"success":true,"result":...}` and
/// `{"success":false,"errorType":...,"errorMessage":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            result: None,
            error_type: None,
            error_message: None,
        }
    }

    pub fn ok_with(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_type: None,
            error_message: None,
        }
    }

    pub fn error(err: &IpcError) -> Self {
        Self {
            success: false,
            result: None,
            error_type: Some(err.error_type),
            error_message: Some(err.message.clone()),
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, IpcError> {
        if self.success {
            Ok(self.result)
        } else {
            Err(IpcError::new(
                self.error_type.unwrap_or(ErrorType::ProtocolError),
                self.error_message.unwrap_or_default(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes() {
        assert_eq!(
            serde_json::to_value(Response::ok()).expect("serialize"),
            json!({"success": true})
        );
        assert_eq!(
            serde_json::to_value(Response::ok_with(json!(5))).expect("serialize"),
            json!({"success": true, "result": 5})
        );
        assert_eq!(
            serde_json::to_value(Response::error(&IpcError::not_found("no such session")))
                .expect("serialize"),
            json!({
                "success": false,
                "errorType": "NotFound",
                "errorMessage": "no such session"
            })
        );
    }

    #[test]
    fn into_result_reconstructs_the_error() {
        let resp: Response = serde_json::from_value(json!({
            "success": false,
            "errorType": "PermissionDenied",
            "errorMessage": "ManagePlugins required"
        }))
        .expect("deserialize");
        let err = resp.into_result().expect_err("error response");
        assert_eq!(err.error_type, ErrorType::PermissionDenied);
        assert_eq!(err.message, "ManagePlugins required");
    }
}
