//! Wire protocol spoken between the host and the isolated render worker.
//!
//! Messages are `type`-tagged JSON objects. Delivery is unordered across
//! distinct logical requests; a render completion is matched to its caller
//! solely by the correlation id echoed in `requestId`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RendererConfigPatch;
use crate::types::RenderMethod;

/// Messages the host publishes on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Request a render of an opaque diagram source string.
    Render {
        request_id: String,
        diagram_text: String,
    },
    /// Apply a partial config on top of the worker's active options.
    ConfigUpdate { config: RendererConfigPatch },
    /// Health check.
    Ping,
}

/// Messages the worker publishes back. `Ready`, `Pong` and `ConfigUpdated`
/// carry no correlation id and are handled as side-channel signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SandboxMessage {
    /// The sandbox finished booting the delegate rendering library.
    Ready,
    /// Completion of a `render` request.
    RenderResult {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        svg: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<RenderMethod>,
    },
    /// Acknowledgement of a `config-update`.
    ConfigUpdated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Health check reply.
    Pong,
}

/// Correlation id for a render call: the caller's logical id plus a random
/// suffix. Globally unique, never reused.
pub fn generate_request_id(id: &str) -> String {
    format!("{id}-{}", Uuid::new_v4().simple())
}
