use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnimoError {
    #[error("Config error: {0}")]
    Config(String),

    /// The renderer process could not be started.
    #[error("Launch error: {0}")]
    Launch(String),

    /// Non-zero renderer exit or a parsed traceback.
    #[error("Render failure: {0}")]
    Render(String),

    /// The artifact could not be moved or uploaded.
    #[error("Publish error: {0}")]
    Publish(String),

    /// The model's tool arguments were not a JSON object.
    #[error("Invalid arguments for {tool}: {message}")]
    ToolArgument { tool: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AnimoError>;
