//! Gateway shared state.

use std::sync::Arc;

use animo_core::config::Config;
use animo_core::error::Result;
use animo_providers::ProviderRegistry;
use animo_render::Renderer;
use animo_tools::ToolRegistry;

/// Shared state accessible from every handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub renderer: Arc<Renderer>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        renderer: Arc<Renderer>,
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            renderer,
            providers,
            tools,
        }
    }

    /// Build the renderer, providers, and built-in tools from config.
    pub fn from_config(config: Config) -> Result<Self> {
        let renderer = animo_render::renderer_from_config(&config)?;
        let providers = ProviderRegistry::from_config(&config);
        Ok(Self::new(
            Arc::new(config),
            Arc::new(renderer),
            Arc::new(providers),
            Arc::new(ToolRegistry::builtin()),
        ))
    }
}
