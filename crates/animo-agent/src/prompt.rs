//! System prompts for code generation and chat generation.

use animo_tools::ToolRegistry;

/// Identity shared by every chat request.
pub const CHAT_IDENTITY: &str = "You are an assistant that creates animations with Manim. \
Manim is a mathematical animation engine that is used to create videos programmatically. \
You are running on Animo (www.animo.video), a tool to create videos with Manim.";

/// Prompt for one-shot code generation.
pub const CODE_GENERATION_PROMPT: &str = r#"
You are an assistant that knows about Manim. Manim is a mathematical animation engine that is used to create videos programmatically.

The following is an example of the code:
```
from manim import *
from math import *

class GenScene(Scene):
def construct(self):
    c = Circle(color=BLUE)
    self.play(Create(c))

```

# Rules
1. Always use GenScene as the class name, otherwise, the code will not work.
2. Always use self.play() to play the animation, otherwise, the code will not work.
3. Do not use text to explain the code, only the code.
4. Do not explain the code, only the code.
"#;

/// Text placed before preview frames when they are handed back to the model.
pub const PREVIEW_FRAMES_INSTRUCTION: &str = "These are frames sampled in order from the preview \
you requested. Check them for overlapping or clipped elements and fix the code if needed.";

/// Build the chat system prompt.
///
/// `caller_system` holds system messages supplied with the request.
pub fn build_system_prompt(
    tools: &ToolRegistry,
    max_tool_iterations: u32,
    caller_system: Option<&str>,
) -> String {
    let mut parts = vec![CHAT_IDENTITY.to_string()];

    let tool_names = tools.list();
    if !tool_names.is_empty() && max_tool_iterations > 0 {
        parts.push(format!(
            "Available tools: {}. Call `preview` with the complete scene code to see rendered frames \
             before giving your final answer. You may call tools at most {max_tool_iterations} times.",
            tool_names.join(", ")
        ));
    }

    if let Some(system) = caller_system.filter(|s| !s.trim().is_empty()) {
        parts.push(system.to_string());
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_budget() {
        let prompt = build_system_prompt(&ToolRegistry::builtin(), 3, None);
        assert!(prompt.starts_with(CHAT_IDENTITY));
        assert!(prompt.contains("at most 3 times"));
    }

    #[test]
    fn test_prompt_without_tools() {
        let prompt = build_system_prompt(&ToolRegistry::new(), 3, Some("Prefer dark themes."));
        assert!(!prompt.contains("Available tools"));
        assert!(prompt.ends_with("Prefer dark themes."));
    }

    #[test]
    fn test_code_generation_prompt_rules() {
        assert!(CODE_GENERATION_PROMPT.contains("Always use GenScene as the class name"));
    }
}
