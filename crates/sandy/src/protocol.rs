//! Method names and parameter shapes exchanged between host, worker and
//! sandboxes.

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    error::{ProtocolError, Result},
    rpc::RequestId,
};

pub type SandboxId = u64;

/// Worker or sandbox is ready; host-bound notification.
pub const NOTIFY_STARTED: &str = "NotifyStarted";
/// Guest-originated capability call; host-bound request.
pub const INVOKE_AMBIENT: &str = "InvokeAmbient";
/// Worker-bound request on the worker channel.
pub const CREATE_SANDBOX: &str = "CreateSandbox";
/// Worker-bound request on the worker channel.
pub const LOAD_SOURCE: &str = "LoadSource";
/// Sandbox-bound request on the sandbox channel.
pub const INVOKE: &str = "Invoke";
/// Sandbox-bound notification.
pub const DISPOSE: &str = "Dispose";
/// Worker-bound notification.
pub const SHUTDOWN: &str = "Shutdown";
/// Either direction; asks the peer to stop working on a request.
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxParams {
    pub name: String,
    pub channel_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSourceParams {
    pub sandbox_id: SandboxId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeParams {
    pub sandbox_id: SandboxId,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub positional_params: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub named_params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeAmbientParams {
    pub method_name: String,
    #[serde(default)]
    pub params: Value,
    pub sandbox_id: SandboxId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|err| ProtocolError::invalid_params(format!("{method}: {err}")).into())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invoke_params_use_camel_case_and_tolerate_nulls() {
        let params: InvokeParams = parse_params(
            INVOKE,
            json!({"sandboxId": 4, "name": "Add", "positionalParams": null}),
        )
        .expect("parse");
        assert_eq!(params.sandbox_id, 4);
        assert!(params.positional_params.is_empty());
        assert!(params.named_params.is_empty());
    }

    #[test]
    fn missing_fields_are_invalid_params() {
        let err = parse_params::<CreateSandboxParams>(CREATE_SANDBOX, json!({"name": "x"}))
            .expect_err("channelAddress is required");
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParams);
    }
}
