//! Media predicate and filename extraction.
//!
//! Extraction must be deterministic: retries and resume matching both rely on
//! the same message always mapping to the same filename.

use crate::download::paths::clean_filename;
use crate::feed::{FeedMessage, Media};

/// Filename and declared size derived from a message's media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub filename: String,
    pub declared_size: Option<u64>,
}

/// A feed message together with its extracted media info.
#[derive(Debug, Clone)]
pub struct Item {
    pub filename: String,
    pub declared_size: Option<u64>,
    pub message: FeedMessage,
}

impl Item {
    pub fn new(message: FeedMessage, info: MediaInfo) -> Self {
        Self {
            filename: info.filename,
            declared_size: info.declared_size,
            message,
        }
    }
}

/// Derive `(filename, size)` from a message, or `None` when it carries no
/// recognized media kind.
pub fn extract(message: &FeedMessage) -> Option<MediaInfo> {
    match message.media.as_ref()? {
        Media::Document {
            id,
            file_name,
            mime_type,
            size,
        } => {
            let filename = file_name
                .as_deref()
                .map(clean_filename)
                .filter(|name| !matches!(name.trim(), "" | "." | ".."))
                .unwrap_or_else(|| synthesize("document", *id, mime_type.as_deref()));
            Some(MediaInfo {
                filename,
                declared_size: Some(*size),
            })
        }
        Media::Photo { id, size } => Some(MediaInfo {
            filename: format!("photo_{}.jpg", id),
            declared_size: *size,
        }),
        Media::Unsupported => None,
    }
}

/// `"<kind>_<id>[.<ext>]"`, extension taken from the content type.
fn synthesize(kind: &str, id: i64, mime_type: Option<&str>) -> String {
    match mime_type.and_then(extension_for_mime) {
        Some(ext) => format!("{}_{}.{}", kind, id, ext),
        None => format!("{}_{}", kind, id),
    }
}

fn extension_for_mime(mime: &str) -> Option<String> {
    let subtype = mime.split(';').next()?.trim().rsplit('/').next()?.trim();
    if subtype.is_empty() {
        return None;
    }
    let ext = match subtype.to_ascii_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        "quicktime" => "mov".to_string(),
        "x-matroska" => "mkv".to_string(),
        "mpeg" if mime.starts_with("audio/") => "mp3".to_string(),
        "x-msvideo" => "avi".to_string(),
        "vnd.rar" | "x-rar-compressed" => "rar".to_string(),
        "x-7z-compressed" => "7z".to_string(),
        other => clean_filename(other),
    };
    (!ext.is_empty()).then_some(ext)
}
