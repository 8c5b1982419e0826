//! Prompts for rewriting written prose into spoken narration.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing the narration style requires
//!    editing exactly one place.
//!
//! 2. **Testability**: unit tests can inspect prompts directly without
//!    calling a real model.
//!
//! Callers can override the system prompt through
//! [`crate::services::LlmRewriter::with_system_prompt`].

/// Default system prompt for the narration rewrite.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a professional audiobook narration editor. Rewrite the written text you are given into natural spoken language that sounds right when read aloud.

Follow these rules precisely:

1. MEANING
   - Keep the meaning, facts, names and numbers exactly as in the original
   - Do not summarise, shorten or add new content

2. SPOKEN STYLE
   - Prefer short, flowing sentences a narrator can say in one breath
   - Replace symbols and abbreviations with the words a narrator would say
   - Keep the language of the original text

3. OUTPUT FORMAT
   - Output ONLY the rewritten text
   - Do NOT add explanations, headings or a preamble
   - Do NOT wrap the answer in quotes or code fences"#;

/// Build the user message for one segment.
pub fn rewrite_request(text: &str) -> String {
    format!(
        "Rewrite the following passage for audiobook narration, keeping its meaning unchanged:\n\n{}",
        text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_embeds_text_verbatim() {
        let msg = rewrite_request("第一句。Second sentence!");
        assert!(msg.ends_with("\n\n第一句。Second sentence!"));
    }

    #[test]
    fn system_prompt_forbids_preambles() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("preamble"));
    }
}
