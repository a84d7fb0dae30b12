// Typed view of provider responses.
//
// Every body is either the error envelope (`{"id", "message", "request_id"}`)
// or a success envelope wrapping the resource (`{"droplet": {...}}`). The
// error shape is tried first, so a body carrying both is an error, never a
// half-populated resource.

use crate::error::ProviderError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiErrorBody {
    /// Provider-assigned error code, e.g. `not_found` or `unprocessable_entity`.
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiEnvelope<T> {
    Error(ApiErrorBody),
    Success(T),
}

impl<T: DeserializeOwned> ApiEnvelope<T> {
    pub fn decode(operation: &'static str, body: &[u8]) -> Result<Self, ProviderError> {
        serde_json::from_slice(body).map_err(|e| ProviderError::MalformedResponse {
            operation,
            detail: e.to_string(),
        })
    }

    /// Collapse the envelope into the resource or a `ProviderError` carrying the
    /// provider's message.
    pub fn into_result(self, operation: &'static str, status: u16) -> Result<T, ProviderError> {
        match self {
            ApiEnvelope::Success(value) if (200..300).contains(&status) => Ok(value),
            ApiEnvelope::Success(_) => Err(ProviderError::MalformedResponse {
                operation,
                detail: format!("resource body returned with status {}", status),
            }),
            ApiEnvelope::Error(err) => Err(ProviderError::Api {
                operation,
                status,
                code: err.id,
                message: err.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct KeyBody {
        ssh_key: serde_json::Value,
    }

    #[test]
    fn success_envelope_yields_resource() {
        let body = br#"{"ssh_key": {"id": 1, "name": "gridoon_root"}}"#;
        let key = ApiEnvelope::<KeyBody>::decode("get ssh key", body)
            .unwrap()
            .into_result("get ssh key", 200)
            .unwrap();
        assert_eq!(key.ssh_key["name"], "gridoon_root");
    }

    #[test]
    fn error_envelope_carries_provider_message() {
        let body = br#"{"id": "unprocessable_entity", "message": "SSH Key is already in use on your account", "request_id": "abc"}"#;
        let err = ApiEnvelope::<KeyBody>::decode("create ssh key", body)
            .unwrap()
            .into_result("create ssh key", 422)
            .unwrap_err();
        match err {
            ProviderError::Api { code, message, status, .. } => {
                assert_eq!(code, "unprocessable_entity");
                assert_eq!(status, 422);
                assert!(message.contains("already in use"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mixed_envelope_is_an_error() {
        let body = br#"{"id": "forbidden", "message": "nope", "ssh_key": {"id": 1}}"#;
        let res = ApiEnvelope::<KeyBody>::decode("get ssh key", body)
            .unwrap()
            .into_result("get ssh key", 200);
        assert!(matches!(res, Err(ProviderError::Api { .. })));
    }

    #[test]
    fn unknown_shape_is_malformed() {
        let res = ApiEnvelope::<KeyBody>::decode("get ssh key", br#"{"keys": []}"#);
        assert!(matches!(res, Err(ProviderError::MalformedResponse { .. })));
    }
}
