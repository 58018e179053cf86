//! Multipart body assembly for requests carrying file attachments.
//!
//! Discord expects attachment *i* under the form field `files[i]` and the
//! JSON portion of the request under `payload_json`. A handful of legacy
//! endpoints (guild emoji, stickers) instead want the JSON object's fields
//! spread as flat form fields.

use reqwest::multipart::{Form, Part};
use serde_json::Value;

/// An in-memory file attachment.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    /// File name presented to Discord.
    pub filename: String,
    /// Raw file contents.
    pub data: Vec<u8>,
    /// MIME type; `application/octet-stream` when unset.
    pub content_type: Option<String>,
}

impl FileAttachment {
    /// Create an attachment from a name and bytes.
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
            content_type: None,
        }
    }

    /// Set the attachment's MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Build a multipart form from attachments plus an optional JSON body.
///
/// With `flat` set, the JSON object's top-level fields become individual
/// text fields instead of a single `payload_json` part.
pub fn build_form(
    files: &[FileAttachment],
    body: Option<&Value>,
    flat: bool,
) -> Result<Form, serde_json::Error> {
    let mut form = Form::new();

    for (i, file) in files.iter().enumerate() {
        let mut part = Part::bytes(file.data.clone()).file_name(file.filename.clone());
        if let Some(content_type) = &file.content_type {
            if let Ok(with_mime) = part.mime_str(content_type) {
                part = with_mime;
            } else {
                part = Part::bytes(file.data.clone()).file_name(file.filename.clone());
            }
        }
        form = form.part(format!("files[{i}]"), part);
    }

    if let Some(body) = body {
        if flat {
            if let Some(map) = body.as_object() {
                for (name, value) in map {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => serde_json::to_string(other)?,
                    };
                    form = form.text(name.clone(), text);
                }
            }
        } else {
            form = form.text("payload_json", serde_json::to_string(body)?);
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_indexed_file_fields() {
        let files = vec![
            FileAttachment::new("a.png", vec![1, 2, 3]),
            FileAttachment::new("b.txt", vec![4]).with_content_type("text/plain"),
        ];
        let form = build_form(&files, Some(&json!({"content": "hi"})), false).unwrap();
        // reqwest does not expose parts for inspection; the boundary is
        // proof enough that assembly succeeded without panicking.
        assert!(!form.boundary().is_empty());
    }

    #[test]
    fn flat_form_spreads_fields() {
        let form = build_form(
            &[FileAttachment::new("emoji.png", vec![0u8; 16])],
            Some(&json!({"name": "blob", "roles": []})),
            true,
        )
        .unwrap();
        assert!(!form.boundary().is_empty());
    }
}
