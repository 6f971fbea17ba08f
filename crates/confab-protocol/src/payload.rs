use std::path::Path;

use serde::{Deserialize, Serialize};

/// Well-known message types. The `type` field on the wire is an open string:
/// readers must tolerate values outside this list and render them as text.
pub mod msg_type {
    pub const TEXT: &str = "text";
    pub const CODE: &str = "code";
    pub const DIFF: &str = "diff";
    pub const SYSTEM: &str = "system";
    pub const FILE: &str = "file";
    pub const SPAWN: &str = "spawn";
}

/// Content of a message. Only the fields appropriate to the envelope's
/// `type` are meaningful; the rest serialize as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
}

impl Payload {
    /// Payload for a plain text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Payload for a code snippet. Guesses the language from the file
    /// extension when not given.
    pub fn code(code: impl Into<String>, file_path: impl Into<String>, language: &str) -> Self {
        let file_path = file_path.into();
        let language = if language.is_empty() && !file_path.is_empty() {
            detect_language(&file_path).to_string()
        } else {
            language.to_string()
        };
        Self {
            code: code.into(),
            file_path,
            language,
            ..Self::default()
        }
    }

    /// Payload for a diff.
    pub fn diff(diff: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            diff: diff.into(),
            file_path: file_path.into(),
            ..Self::default()
        }
    }
}

/// Guess a highlighting language from a file extension. Dockerfiles are
/// recognized by name as well, since `Dockerfile` has no extension.
pub fn detect_language(path: &str) -> &'static str {
    let file = Path::new(path);
    if file
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case("dockerfile"))
    {
        return "dockerfile";
    }
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "go" => "go",
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "rs" => "rust",
        "rb" => "ruby",
        "java" => "java",
        "c" => "c",
        "cpp" | "cc" | "cxx" | "h" | "hpp" => "cpp",
        "cs" => "csharp",
        "sh" | "bash" => "bash",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "md" => "markdown",
        "html" | "htm" => "html",
        "css" => "css",
        "sql" => "sql",
        "dockerfile" => "dockerfile",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_payload_detects_language() {
        let p = Payload::code("fn main() {}", "src/main.rs", "");
        assert_eq!(p.language, "rust");
    }

    #[test]
    fn code_payload_keeps_explicit_language() {
        let p = Payload::code("SELECT 1", "query.txt", "sql");
        assert_eq!(p.language, "sql");
    }

    #[test]
    fn unknown_extension_maps_to_empty() {
        assert_eq!(detect_language("notes.xyz"), "");
        assert_eq!(detect_language("no-extension"), "");
    }

    #[test]
    fn dockerfiles_detected_by_name_or_extension() {
        assert_eq!(detect_language("Dockerfile"), "dockerfile");
        assert_eq!(detect_language("deploy/dockerfile"), "dockerfile");
        assert_eq!(detect_language("base.dockerfile"), "dockerfile");
    }

    #[test]
    fn empty_fields_are_omitted() {
        let json = serde_json::to_string(&Payload::text("hi")).unwrap();
        assert_eq!(json, r#"{"text":"hi"}"#);
    }
}
