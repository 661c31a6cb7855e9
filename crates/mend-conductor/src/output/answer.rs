//! Best-effort extraction of an agent's final answer from its transcript.
//!
//! Agent CLIs print wildly different transcript formats, so this is a
//! heuristic behind a narrow trait. Callers only ever show the result to the
//! user; nothing in the workflow depends on it.

use serde::Deserialize;

/// Full transcript text in, best-effort final answer out.
pub trait AnswerExtractor: Send + Sync {
    fn extract(&self, transcript: &str) -> Option<String>;
}

/// Relevant fields from Claude Code's `--output-format stream-json` lines.
/// Unknown message types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "assistant")]
    Assistant { message: serde_json::Value },
    #[serde(rename = "result")]
    Result {
        #[serde(default, rename = "result")]
        result_text: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Markers after which plain-text transcripts usually put their conclusion.
const ANSWER_MARKERS: &[&str] = &["final answer:", "summary:"];

/// Default extractor: stream-json result, then marker, then last paragraph.
#[derive(Debug, Clone)]
pub struct TranscriptAnswerExtractor {
    pub max_chars: usize,
}

impl Default for TranscriptAnswerExtractor {
    fn default() -> Self {
        Self { max_chars: 600 }
    }
}

impl TranscriptAnswerExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl AnswerExtractor for TranscriptAnswerExtractor {
    fn extract(&self, transcript: &str) -> Option<String> {
        let answer = from_stream_json(transcript)
            .or_else(|| after_marker(transcript))
            .or_else(|| last_paragraph(transcript))?;
        Some(truncate(answer.trim(), self.max_chars))
    }
}

fn from_stream_json(transcript: &str) -> Option<String> {
    let mut result_text: Option<String> = None;
    let mut assistant_text: Option<String> = None;

    for line in transcript.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<StreamMessage>(trimmed) {
            Ok(StreamMessage::Result {
                result_text: Some(text),
            }) if !text.trim().is_empty() => result_text = Some(text),
            Ok(StreamMessage::Assistant { message }) => {
                if let Some(text) = assistant_text_blocks(&message) {
                    assistant_text = Some(text);
                }
            }
            _ => {}
        }
    }

    result_text.or(assistant_text)
}

/// Join the `text` blocks of an assistant message, skipping tool calls.
fn assistant_text_blocks(message: &serde_json::Value) -> Option<String> {
    let blocks = message.get("content")?.as_array()?;
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .filter(|t| !t.trim().is_empty())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn after_marker(transcript: &str) -> Option<String> {
    let alternatives: Vec<String> = ANSWER_MARKERS.iter().map(|m| regex::escape(m)).collect();
    let re = regex::Regex::new(&format!("(?i){}", alternatives.join("|"))).ok()?;
    let marker = re.find_iter(transcript).last()?;
    let rest = transcript[marker.end()..].trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

fn last_paragraph(transcript: &str) -> Option<String> {
    transcript
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .last()
        .map(String::from)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
