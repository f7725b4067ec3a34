// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::listing::Item;

/// Maximum length for a sanitized filename component
const MAX_COMPONENT_LENGTH: usize = 100;

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Filename stem (without extension) for an item
///
/// Format: "YYYYMMDD - sanitized-title [sanitized-id]", with "undated" in
/// place of the date when the listing does not provide one.
pub fn artifact_stem(item: &Item) -> String {
    let date_prefix = item
        .published
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let title = sanitize_component(&item.title);
    let id = sanitize_component(&item.item_id);

    if title.is_empty() {
        format!("{} [{}]", date_prefix, id)
    } else {
        format!("{} - {} [{}]", date_prefix, title, id)
    }
}

/// Complete filename for an item's media file
pub fn artifact_filename(item: &Item) -> String {
    format!("{}.{}", artifact_stem(item), media_extension(item))
}

/// File extension for an item's media, from the URL path or MIME type
pub fn media_extension(item: &Item) -> String {
    let Some(media) = &item.media else {
        return "mp4".to_string();
    };

    if let Some(ext) = media
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|filename| filename.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| is_valid_media_extension(ext))
    {
        return ext.to_lowercase();
    }

    if let Some(ref mime) = media.mime_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    match media.mime_type.as_deref() {
        Some(mime) if mime.starts_with("video/") => "mp4".to_string(),
        _ => "mp3".to_string(),
    }
}

/// Sanitize a title or id for use in a filename
pub fn sanitize_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);

    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    truncate_at_boundary(trimmed, MAX_COMPONENT_LENGTH)
}

/// Collapse runs of spaces and dashes into a single dash
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    // Input is ASCII at this point, so byte and char positions agree
    let truncated = &s[..max_len];
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

fn is_valid_media_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3"
            | "m4a"
            | "aac"
            | "ogg"
            | "opus"
            | "wav"
            | "flac"
            | "mp4"
            | "m4v"
            | "webm"
            | "mkv"
            | "mov"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        "video/x-m4v" => Some("m4v"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        _ => None,
    }
}
