//! Tools exposed to the LLM during chat generation.
//!
//! Each tool implements the [`Tool`] trait; the [`ToolRegistry`] declares
//! them to a provider and dispatches calls by name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use animo_providers::{ModelApi, ToolDefinition};
use animo_render::{AspectRatio, Renderer};

pub mod preview;

pub use preview::PreviewTool;

/// Context provided to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub renderer: Arc<Renderer>,
    /// Cancelled when the requesting client goes away.
    pub cancel: CancellationToken,
    pub aspect_ratio: AspectRatio,
    /// Prefix for scratch directories created on behalf of this request.
    pub name_hint: String,
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<ToolMedia>>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            media: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            media: None,
        }
    }
}

/// An image attached to a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMedia {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    /// Position in the tool's original output order.
    pub index: u32,
}

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g., "preview").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// Provider families this tool is declared to.
    fn supports(&self, _api: ModelApi) -> bool {
        true
    }

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tools.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PreviewTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool declarations for one provider family.
    pub fn declared_for(&self, api: ModelApi) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| t.supports(api))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AnthropicOnly;

    #[async_trait]
    impl Tool for AnthropicOnly {
        fn name(&self) -> &str {
            "anthropic_only"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn description(&self) -> &str {
            "test"
        }
        fn supports(&self, api: ModelApi) -> bool {
            api == ModelApi::AnthropicMessages
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _context: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.list(), vec!["preview"]);
        assert!(registry.get("preview").is_some());
        assert!(registry.get("exec").is_none());
    }

    #[test]
    fn test_declared_for_filters_by_family() {
        let mut registry = ToolRegistry::builtin();
        registry.register(Box::new(AnthropicOnly));

        let openai = registry.declared_for(ModelApi::OpenAiCompletions);
        assert_eq!(openai.len(), 1);
        assert_eq!(openai[0].name, "preview");
        assert_eq!(openai[0].parameters_schema["required"][0], "code");

        let anthropic = registry.declared_for(ModelApi::AnthropicMessages);
        assert_eq!(anthropic.len(), 2);
    }
}
