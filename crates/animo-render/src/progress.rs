//! Line classifier that turns renderer stderr into progress events.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

static ANIMATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Animation (\d+):").expect("animation pattern is valid"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)%").expect("percentage pattern is valid"));

/// Marker that opens a Python traceback block.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last)";

/// Structured notification derived from one render job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    AnimationStarted { index: i64 },
    PercentageUpdated { index: i64, percentage: u32 },
    Completed { artifact_url: Option<String> },
    Failed { message: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// JSON object sent to streaming callers, one per line.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::AnimationStarted { index } => json!({ "animationIndex": index, "percentage": 0 }),
            Self::PercentageUpdated { index, percentage } => {
                json!({ "animationIndex": index, "percentage": percentage })
            }
            Self::Completed { artifact_url } => json!({ "video_url": artifact_url }),
            Self::Failed { message } => json!({ "error": message }),
        }
    }

    /// Newline-terminated wire line.
    pub fn to_wire_line(&self) -> String {
        let mut line = self.to_wire().to_string();
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Normal,
    InError,
}

/// State machine over the renderer's stderr lines.
#[derive(Debug)]
pub struct ProgressParser {
    state: ParserState,
    current_animation: i64,
    current_percentage: u32,
    error_lines: Vec<String>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self {
            state: ParserState::Normal,
            current_animation: -1,
            current_percentage: 0,
            error_lines: Vec::new(),
        }
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_error_block(&self) -> bool {
        self.state == ParserState::InError
    }

    pub fn current_animation(&self) -> i64 {
        self.current_animation
    }

    /// Classify one line. A single line may start an animation and report a
    /// percentage at once, so more than one event can come back.
    pub fn feed(&mut self, line: &str) -> Vec<ProgressEvent> {
        let mut events = Vec::new();

        match self.state {
            ParserState::InError => {
                if line.trim().is_empty() {
                    let message = std::mem::take(&mut self.error_lines).join("\n");
                    self.state = ParserState::Normal;
                    events.push(ProgressEvent::Failed { message });
                } else {
                    self.error_lines.push(line.to_string());
                }
            }
            ParserState::Normal => {
                if line.contains(TRACEBACK_MARKER) {
                    self.state = ParserState::InError;
                    self.error_lines.clear();
                    return events;
                }

                if let Some(index) = capture_number::<i64>(&ANIMATION_RE, line) {
                    if index != self.current_animation {
                        self.current_animation = index;
                        self.current_percentage = 0;
                        events.push(ProgressEvent::AnimationStarted { index });
                    }
                }

                if let Some(percentage) = capture_number::<u32>(&PERCENT_RE, line) {
                    if percentage != self.current_percentage {
                        self.current_percentage = percentage;
                        events.push(ProgressEvent::PercentageUpdated {
                            index: self.current_animation,
                            percentage,
                        });
                    }
                }
            }
        }

        events
    }
}

fn capture_number<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
