use crate::types::{MessageContent, RawEvent};

/// Maximum number of characters of a text body shown in a preview.
pub const PREVIEW_MAX_CHARS: usize = 50;

const ELLIPSIS: &str = "...";
const UNKNOWN_PLACEHOLDER: &str = "unsupported message";

/// Renders the one-line preview shown in the chat list and message bubbles.
pub fn extract_preview(event: &RawEvent) -> String {
    preview_for(&event.content)
}

pub fn preview_for(content: &MessageContent) -> String {
    match content {
        MessageContent::Text { body } => truncate(body),
        MessageContent::Sticker { .. } => "sticker".to_string(),
        MessageContent::Image { .. } => "image".to_string(),
        MessageContent::Video { .. } => "video".to_string(),
        MessageContent::Audio { seconds, .. } => match seconds {
            Some(seconds) => format!("voice message ({seconds}s)"),
            None => "voice message".to_string(),
        },
        MessageContent::Document { file_name, .. } => match non_blank(file_name.as_deref()) {
            Some(name) => format!("document: {name}"),
            None => "document".to_string(),
        },
        MessageContent::Location { name, address, .. } => {
            match non_blank(name.as_deref()).or(non_blank(address.as_deref())) {
                Some(place) => format!("location: {place}"),
                None => "location".to_string(),
            }
        }
        MessageContent::Poll { question, .. } => match non_blank(Some(question)) {
            Some(question) => format!("poll: {}", truncate(question)),
            None => "poll".to_string(),
        },
        MessageContent::Unknown => UNKNOWN_PLACEHOLDER.to_string(),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Collapses line breaks and cuts to [`PREVIEW_MAX_CHARS`] characters.
fn truncate(text: &str) -> String {
    let single_line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    if single_line.chars().count() <= PREVIEW_MAX_CHARS {
        return single_line;
    }

    let mut cut: String = single_line.chars().take(PREVIEW_MAX_CHARS).collect();
    cut.push_str(ELLIPSIS);
    cut
}
