use serde::{Deserialize, Serialize};

/// What a mounted provider/model advertises. The orchestrator consults
/// this before enabling tool use or forwarding a `thinking` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: false,
            supports_streaming: false,
            supports_thinking: false,
            context_window_tokens: None,
            max_output_tokens: None,
        }
    }
}
