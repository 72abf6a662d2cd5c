use grelay_relay_core::{FormPart, RelayError};
use wreq::multipart::{Form, Part};

/// Scratch key for the parts of a multipart upload, set by `convert_body`
/// and taken back when the request is sent.
pub const FORM_KEY: &str = "form_parts";

/// Copy of `parts` with the `model` field replaced, or prepended when absent.
pub fn with_model(parts: &[FormPart], model: &str) -> Vec<FormPart> {
    let mut out = Vec::with_capacity(parts.len() + 1);
    let mut replaced = false;
    for part in parts {
        if part.name == "model" && !part.is_file() {
            if !replaced {
                out.push(FormPart::text("model", model));
                replaced = true;
            }
            continue;
        }
        out.push(part.clone());
    }
    if !replaced {
        out.insert(0, FormPart::text("model", model));
    }
    out
}

pub fn build(parts: Vec<FormPart>) -> Result<Form, RelayError> {
    let mut form = Form::new();
    for part in parts {
        let FormPart {
            name,
            file_name,
            content_type,
            data,
        } = part;
        let mut upload = Part::bytes(data.to_vec());
        if let Some(file_name) = file_name {
            upload = upload.file_name(file_name);
        }
        if let Some(content_type) = content_type {
            upload = upload.mime_str(&content_type).map_err(|err| {
                RelayError::invalid_request(format!(
                    "invalid content type of field {name}: {err}"
                ))
            })?;
        }
        form = form.part(name, upload);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn file(name: &str, content_type: &str) -> FormPart {
        FormPart {
            name: name.to_string(),
            file_name: Some("a.wav".to_string()),
            content_type: Some(content_type.to_string()),
            data: Bytes::from_static(b"RIFF"),
        }
    }

    #[test]
    fn model_field_is_replaced_once() {
        let parts = vec![
            FormPart::text("model", "whisper"),
            file("file", "audio/wav"),
            FormPart::text("model", "dup"),
        ];
        let out = with_model(&parts, "whisper-1");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], FormPart::text("model", "whisper-1"));
        assert!(out[1].is_file());
    }

    #[test]
    fn missing_model_is_prepended() {
        let out = with_model(&[file("file", "audio/wav")], "whisper-1");
        assert_eq!(out[0].name, "model");
    }

    #[test]
    fn builds_text_and_file_parts() {
        let form = build(vec![FormPart::text("model", "whisper-1"), file("file", "audio/wav")]);
        assert!(form.is_ok());
    }

    #[test]
    fn malformed_part_content_type_is_rejected() {
        let err = build(vec![file("file", "not a mime")]).unwrap_err();
        assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
        assert!(err.message.contains("file"));
    }
}
