//! Prompt construction for the generative stages.

use serde_json::Value;

use crate::artifact::{CodeArtifact, Diagnostic};
use crate::chat::{ChatMessage, ChatRole};
use crate::model::{ModelRequest, Purpose};
use crate::session::SessionContext;

pub const GENERATE_SYSTEM: &str = "You are an expert Manim Community Edition animator. \
Write a single complete Python module that renders the requested animation. \
Start with `from manim import *`, define exactly one class deriving from Scene (or a Scene subclass) \
with a `construct(self)` method, and only use APIs that exist in Manim Community Edition. \
Reply with the code in one ```python fenced block and nothing else.";

pub const REPAIR_SYSTEM: &str = "You fix broken Manim Community Edition scenes. \
You are given a Python module and the error it produced. Return the whole corrected module, \
keeping the same scene class name and the original intent. \
Reply with the code in one ```python fenced block and nothing else.";

pub const IMPROVE_SYSTEM: &str = "You refine working Manim Community Edition scenes. \
Return the whole improved module with the same scene class name. Keep it renderable and \
reasonably short. If the scene needs no change, return it unchanged. \
Reply with the code in one ```python fenced block and nothing else.";

const AUTO_IMPROVE_INSTRUCTION: &str = "Improve the visual quality of this animation: smoother \
timing, clear layout without overlapping objects, readable text and consistent colours.";

fn fenced(code: &CodeArtifact) -> String {
    format!("```python\n{}\n```", code.source().trim_end())
}

fn render_preferences(context: &SessionContext) -> Option<String> {
    if context.preferences.is_empty() {
        return None;
    }
    let lines: Vec<String> = context
        .preferences
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("- {key}: {s}"),
            other => format!("- {key}: {other}"),
        })
        .collect();
    Some(format!("User preferences:\n{}", lines.join("\n")))
}

fn history(context: &SessionContext) -> Vec<ChatMessage> {
    context
        .recent_turns
        .iter()
        .map(|turn| match turn.role {
            ChatRole::User => ChatMessage::user().content(turn.content.clone()).build(),
            ChatRole::Assistant => ChatMessage::assistant().content(turn.content.clone()).build(),
        })
        .collect()
}

/// Request for a fresh scene. `attempt` > 1 marks a retry after unusable output.
pub fn generation_request(prompt: &str, context: &SessionContext, attempt: u32) -> ModelRequest {
    let mut sections = Vec::new();
    if let Some(prefs) = render_preferences(context) {
        sections.push(prefs);
    }
    if let Some(code) = &context.last_code {
        sections.push(format!(
            "The most recent animation in this conversation was:\n{}",
            fenced(code)
        ));
    }
    sections.push(format!("Request: {}", prompt.trim()));
    if attempt > 1 {
        sections.push(
            "Your previous answer did not contain usable code. Return one complete module in a ```python block."
                .into(),
        );
    }

    let mut messages = history(context);
    messages.push(ChatMessage::user().content(sections.join("\n\n")).build());
    ModelRequest {
        purpose: Purpose::Generate,
        system: GENERATE_SYSTEM.into(),
        messages,
    }
}

pub fn repair_request(code: &CodeArtifact, diagnostic: &Diagnostic, context: &SessionContext) -> ModelRequest {
    let mut body = format!(
        "This scene failed during {}:\n{}\n\nError:\n{}",
        diagnostic.stage,
        fenced(code),
        diagnostic.message
    );
    if let Some(raw) = diagnostic.raw_output.as_deref().filter(|r| !r.trim().is_empty()) {
        body.push_str(&format!("\n\nTool output:\n```\n{}\n```", raw.trim_end()));
    }
    if let Some(prefs) = render_preferences(context) {
        body.push_str("\n\n");
        body.push_str(&prefs);
    }
    ModelRequest {
        purpose: Purpose::Repair,
        system: REPAIR_SYSTEM.into(),
        messages: vec![ChatMessage::user().content(body).build()],
    }
}

pub fn improve_request(code: &CodeArtifact, feedback: Option<&str>, context: &SessionContext) -> ModelRequest {
    let instruction = feedback
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| format!("Apply this feedback: {f}"))
        .unwrap_or_else(|| AUTO_IMPROVE_INSTRUCTION.to_string());
    let mut body = format!("{instruction}\n\n{}", fenced(code));
    if let Some(prefs) = render_preferences(context) {
        body.push_str("\n\n");
        body.push_str(&prefs);
    }
    let mut messages = history(context);
    messages.push(ChatMessage::user().content(body).build());
    ModelRequest {
        purpose: Purpose::Improve,
        system: IMPROVE_SYSTEM.into(),
        messages,
    }
}

/// Pulls program text out of a model reply.
///
/// Prefers a fenced block tagged `python`/`py`, then any fenced block, then
/// the whole reply when it already looks like a module. Returns `None` when
/// nothing resembling code is present.
pub fn extract_code(reply: &str) -> Option<String> {
    let blocks = fenced_blocks(reply);
    let tagged = blocks
        .iter()
        .find(|(lang, body)| matches!(*lang, "python" | "py" | "python3") && !body.trim().is_empty());
    let any = blocks.iter().find(|(_, body)| !body.trim().is_empty());
    if let Some((_, body)) = tagged.or(any) {
        return Some(body.trim_matches('\n').to_string());
    }

    let trimmed = reply.trim();
    let looks_like_module = trimmed.contains("class ") && (trimmed.contains("import ") || trimmed.contains("def "));
    looks_like_module.then(|| trimmed.to_string())
}

fn fenced_blocks(reply: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = reply;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(newline) = after.find('\n') else {
            break;
        };
        let lang = after[..newline].trim();
        let body_start = &after[newline + 1..];
        match body_start.find("```") {
            Some(close) => {
                blocks.push((lang, &body_start[..close]));
                rest = &body_start[close + 3..];
            }
            None => {
                // Unclosed fence: take everything after it.
                blocks.push((lang, body_start));
                break;
            }
        }
    }
    blocks
}
