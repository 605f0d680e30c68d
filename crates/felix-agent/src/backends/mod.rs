pub mod api;
pub mod cli;

pub use api::ApiWorker;
pub use cli::CliWorker;

use felix_core::TokenUsage;

/// Token counts from a `usage` object, accepting both the Anthropic
/// (`input_tokens`/`output_tokens`) and OpenAI (`prompt_tokens`/
/// `completion_tokens`) spellings.
pub(crate) fn parse_usage(usage: &serde_json::Value) -> TokenUsage {
    let input = usage["input_tokens"]
        .as_u64()
        .or_else(|| usage["prompt_tokens"].as_u64())
        .unwrap_or(0);
    let output = usage["output_tokens"]
        .as_u64()
        .or_else(|| usage["completion_tokens"].as_u64())
        .unwrap_or(0);
    TokenUsage::new(input, output)
}

/// First `max` characters of `s`, for error messages.
pub(crate) fn excerpt(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
