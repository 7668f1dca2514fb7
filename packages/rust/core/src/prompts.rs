//! Prompt construction for extraction and re-generation calls.

use loresmith_shared::{ChatMessage, Chunk};

/// System prompt for worldbook extraction.
const EXTRACTION_SYSTEM_PROMPT: &str = "You extract structured worldbook entries from narrative \
text. Answer ONLY with a JSON object of the form \
{\"<category>\": {\"<entry name>\": {\"keywords\": [\"…\"], \"content\": \"…\"}}}. \
Group entries under category names such as 角色 (characters), 地点 (places), 物品 (items), \
剧情大纲 (plot outline). Keywords are short trigger words for the entry; content is a \
self-contained description drawn only from the given text. Do not invent facts, do not wrap \
the JSON in commentary or code fences.";

/// Build the message list for extracting one chunk.
pub fn extraction_messages(chunk: &Chunk) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
        ChatMessage::user(extraction_user_prompt(chunk)),
    ]
}

/// The user prompt carrying the chunk itself.
pub fn extraction_user_prompt(chunk: &Chunk) -> String {
    format!(
        "Chapter {} — {}\n\nTEXT:\n{}",
        chunk.index + 1,
        chunk.title,
        chunk.content
    )
}
