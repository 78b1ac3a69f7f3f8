use common::storage::types::message::{format_history, Message};
use serde::Serialize;

use crate::{guardrails::NO_KNOWLEDGE_MESSAGE, policy::ResponsePolicy, RetrievedChunk};

const EXCERPT_CHARS: usize = 500;

pub const SYSTEM_PREAMBLE: &str =
    "You are a factual assistant that answers only from the provided IRS.gov knowledge snippets.";

pub const FOLLOW_UP_SYSTEM_PROMPT: &str =
    "You generate helpful, on-topic follow-up questions. Respond ONLY with a JSON array.";

#[derive(Serialize)]
struct ContextLine<'a> {
    url: &'a str,
    title: &'a str,
    section_heading: Option<&'a str>,
    char_start: usize,
    char_end: usize,
    excerpt: String,
}

/// Inputs to the answer prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub chunks: &'a [RetrievedChunk],
    pub query: &'a str,
    pub history: &'a [Message],
    pub summary: Option<&'a str>,
    pub history_turns: usize,
}

fn context_block(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|hit| {
            let line = ContextLine {
                url: &hit.chunk.url,
                title: &hit.chunk.title,
                section_heading: hit.chunk.section_heading.as_deref(),
                char_start: hit.chunk.char_start,
                char_end: hit.chunk.char_end,
                excerpt: hit.chunk.text.chars().take(EXCERPT_CHARS).collect(),
            };
            serde_json::to_string(&line).unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders the generation prompt. Pure; the same input always yields the
/// same text.
pub fn build_prompt(input: PromptInput<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str("CONTEXT:\n");
    prompt.push_str(&context_block(input.chunks));
    prompt.push_str("\n\n");

    if let Some(summary) = input.summary.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("CONVERSATION SUMMARY:\n");
        prompt.push_str(summary);
        prompt.push_str("\n\n");
    }

    if !input.history.is_empty() {
        prompt.push_str("CONVERSATION HISTORY:\n");
        prompt.push_str(&format_history(input.history, input.history_turns));
        prompt.push_str("\n\n");
    }

    prompt.push_str("USER:\n");
    prompt.push_str(input.query.trim());
    prompt.push_str("\n\n");

    prompt.push_str(&format!(
        "ASSISTANT INSTRUCTIONS:\n\
         - Use only the provided context. If it does not support an answer, say exactly: \"{NO_KNOWLEDGE_MESSAGE}\"\n\
         - Answer concisely (<= 400 words). Use bullet steps for procedures.\n\
         - Do not write your own \"Sources\" section; citations are attached separately.\n\
         - If sources conflict, present both and mark the uncertainty.\n\
         - Keep IRS form numbers exactly as they appear in the context.\n"
    ));

    prompt
}

pub fn system_prompt(policy: &ResponsePolicy) -> String {
    format!(
        "{SYSTEM_PREAMBLE} Follow this response style: {}",
        policy.style_instruction
    )
}

pub fn follow_up_prompt(query: &str, answer: &str) -> String {
    format!(
        "Given the user's question and the assistant's answer, suggest 3-5 short, clickable \
         follow-up questions that are directly relevant. Keep each under 80 characters. \
         Return as a JSON array of strings only.\n\nQuestion: {query}\n\nAnswer: {answer}\n"
    )
}
