//! Repair and extraction of diagram definitions from raw function arguments.
//!
//! Models frequently emit the definition as a back-tick delimited block inside
//! otherwise JSON arguments, with stray escapes, raw line breaks and unescaped
//! quotes. The pipeline here turns that into valid JSON, validates it against
//! the function schema and extracts an [`ExtractedDiagram`].

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::function::{DiagramType, FUNCTION_NAME, parameters_schema};

/// Lines before the first one starting with one of these are discarded.
pub const DIAGRAM_KEYWORDS: &[&str] = &[
    "graph",
    "flowchart",
    "subgraph",
    "classDef",
    "classDiagram",
    "%%",
    "style",
    "app",
    "sequenceDiagram",
    "gantt",
    "pie",
    "stateDiagram",
    "erDiagram",
    "journey",
    "requirement",
    "gitGraph",
];

/// Legacy and alternative argument names, mapped to the canonical ones
const KEY_ALIASES: &[(&str, &str)] = &[
    ("diagram_text_definition", "definitionText"),
    ("mermaid_diagram_text_definition", "definitionText"),
    ("diagram_type", "diagramType"),
    ("diagram_title", "title"),
    ("notes", "explanation"),
];

static DEFINITION_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""(?:definitionText|diagram_text_definition|mermaid_diagram_text_definition)"\s*:\s*`([^`]*)`"#,
    )
    .unwrap()
});

static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\\(.?)").unwrap());

static SCHEMA: LazyLock<Option<jsonschema::Validator>> = LazyLock::new(|| {
    jsonschema::validator_for(&parameters_schema())
        .map_err(|e| tracing::warn!("diagram function schema does not compile: {}", e))
        .ok()
});

/// Why a function call could not be turned into a diagram
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    /// The arguments could not be repaired into valid, conforming JSON
    #[error("could not read the function arguments: {message}")]
    Sanitization { message: String, payload: String },

    /// The definition was missing or contained no recognizable diagram
    #[error("the diagram definition is empty")]
    EmptyDefinition,
}

impl SanitizeError {
    fn malformed(message: impl Into<String>, payload: &str) -> Self {
        SanitizeError::Sanitization {
            message: message.into(),
            payload: payload.to_string(),
        }
    }
}

/// A diagram definition with its auxiliary fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedDiagram {
    pub definition_text: String,
    #[serde(default)]
    pub explanation: String,
    pub diagram_type: DiagramType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Extract a diagram from raw function-call arguments.
pub fn sanitize(raw: &str) -> Result<ExtractedDiagram, SanitizeError> {
    let payload = repair_payload(raw)?;

    let mut value: Value = serde_json::from_str(&payload)
        .map_err(|e| SanitizeError::malformed(format!("invalid JSON: {}", e), raw))?;
    normalize_keys(&mut value);

    if let Some(violations) = schema_violations(&value) {
        return Err(SanitizeError::malformed(violations, raw));
    }

    let mut diagram: ExtractedDiagram = serde_json::from_value(value)
        .map_err(|e| SanitizeError::malformed(e.to_string(), raw))?;

    diagram.definition_text = diagram.definition_text.trim().to_string();
    if diagram.definition_text.is_empty() {
        return Err(SanitizeError::EmptyDefinition);
    }
    diagram.explanation = diagram.explanation.trim().to_string();
    diagram.title = diagram
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    Ok(diagram)
}

/// Replace a back-tick delimited definition with a properly quoted JSON
/// string. Payloads without such a span are returned trimmed.
pub fn repair_payload(raw: &str) -> Result<String, SanitizeError> {
    let Some(span) = DEFINITION_SPAN.captures(raw).and_then(|c| c.get(1)) else {
        return Ok(raw.trim().to_string());
    };

    let cleaned = clean_definition(span.as_str())
        .map_err(|e| SanitizeError::malformed(format!("unreadable definition: {}", e), raw))?;
    let quoted = serde_json::to_string(&cleaned)
        .map_err(|e| SanitizeError::malformed(e.to_string(), raw))?;

    // the span is wrapped in one back-tick on each side
    let mut repaired = String::with_capacity(raw.len() + 16);
    repaired.push_str(&raw[..span.start() - 1]);
    repaired.push_str(&quoted);
    repaired.push_str(&raw[span.end() + 1..]);
    Ok(repaired.trim().to_string())
}

fn clean_definition(span: &str) -> serde_json::Result<String> {
    let repaired = repair_escapes(span.trim());
    let lines_escaped = repaired.replace("\r\n", "\\n").replace('\n', "\\n");
    let stripped = strip_control_chars(&lines_escaped);
    let quoted = escape_bare_quotes(&stripped);
    let decoded: String = serde_json::from_str(&format!("\"{}\"", quoted))?;
    Ok(trim_to_diagram_start(&decoded))
}

/// Keep the JSON escapes `\" \/ \b \f \n \r \t \\`; any other backslash
/// sequence collapses to the escaped character. A trailing lone backslash is
/// dropped.
pub fn repair_escapes(text: &str) -> String {
    ESCAPE_SEQUENCE
        .replace_all(text, |caps: &Captures| {
            let escaped = &caps[1];
            match escaped {
                "\"" | "/" | "b" | "f" | "n" | "r" | "t" | "\\" => format!("\\{}", escaped),
                other => other.to_string(),
            }
        })
        .into_owned()
}

/// Remove ASCII control characters (code points 0-31)
pub fn strip_control_chars(text: &str) -> String {
    text.chars().filter(|c| u32::from(*c) > 31).collect()
}

/// Escape double quotes that are not already part of an escape pair
fn escape_bare_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push('\\');
                out.push(chars.next().unwrap_or('\\'));
            }
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

/// Drop leading lines until one starts with a diagram keyword.
///
/// Returns an empty string when no line does.
pub fn trim_to_diagram_start(definition: &str) -> String {
    let lines: Vec<&str> = definition.split('\n').collect();
    lines
        .iter()
        .position(|line| {
            let line = line.trim_start();
            DIAGRAM_KEYWORDS.iter().any(|kw| line.starts_with(kw))
        })
        .map(|start| lines[start..].join("\n"))
        .unwrap_or_default()
}

fn normalize_keys(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for (alias, canonical) in KEY_ALIASES {
        if object.contains_key(*canonical) {
            continue;
        }
        if let Some(v) = object.remove(*alias) {
            object.insert(canonical.to_string(), v);
        }
    }
    if object.get("title").is_some_and(Value::is_null) {
        object.remove("title");
    }
}

/// One line per schema violation, naming the offending field.
fn schema_violations(value: &Value) -> Option<String> {
    let validator = SCHEMA.as_ref()?;
    let mut lines = Vec::new();
    for error in validator.iter_errors(value) {
        let field = error.instance_path.to_string();
        let field = field.trim_start_matches('/');
        if field.is_empty() {
            lines.push(format!("- {}", error));
        } else {
            lines.push(format!("- `{}`: {}", field, error));
        }
    }

    (!lines.is_empty()).then(|| {
        format!(
            "the {} arguments are missing fields or have invalid values:\n{}",
            FUNCTION_NAME,
            lines.join("\n")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"{"title": "Login", "diagramType": "flowchart", "explanation": "User login", "definitionText": "flowchart TD\nA-->B"}"#;

    #[test]
    fn test_well_formed_payload() {
        let diagram = sanitize(WELL_FORMED).unwrap();
        assert_eq!(diagram.definition_text, "flowchart TD\nA-->B");
        assert_eq!(diagram.explanation, "User login");
        assert_eq!(diagram.diagram_type, DiagramType::Flowchart);
        assert_eq!(diagram.title.as_deref(), Some("Login"));
    }

    #[test]
    fn test_idempotent_on_well_formed_payload() {
        let first = sanitize(WELL_FORMED).unwrap();
        let reencoded = serde_json::to_string(&first).unwrap();
        assert_eq!(sanitize(&reencoded).unwrap(), first);
        assert_eq!(repair_payload(WELL_FORMED).unwrap(), WELL_FORMED);
    }

    #[test]
    fn test_backtick_definition_is_repaired() {
        let raw = "{\"diagramType\": \"flowchart\", \"explanation\": \"\\nLogin flow\\n\", \
                   \"definitionText\": `Here you go:\nflowchart TD\n  A[\"Start\"] --> B\\q`}";
        let diagram = sanitize(raw).unwrap();
        assert_eq!(diagram.definition_text, "flowchart TD\n  A[\"Start\"] --> Bq");
        assert_eq!(diagram.explanation, "Login flow");
        assert!(diagram.title.is_none());

        let repaired = repair_payload(raw).unwrap();
        assert_eq!(sanitize(&repaired).unwrap(), diagram);
    }

    #[test]
    fn test_legacy_argument_names() {
        let raw = "{\"diagram_title\": \"T\", \"diagram_type\": \"sequence\", \"explanation\": \"e\", \
                   \"diagram_text_definition\": `sequenceDiagram\nAlice->>Bob: hi`}";
        let diagram = sanitize(raw).unwrap();
        assert_eq!(diagram.diagram_type, DiagramType::Sequence);
        assert_eq!(diagram.definition_text, "sequenceDiagram\nAlice->>Bob: hi");
        assert_eq!(diagram.title.as_deref(), Some("T"));
    }

    #[test]
    fn test_repair_escapes() {
        assert_eq!(repair_escapes(r"a\qb"), "aqb");
        assert_eq!(repair_escapes(r"a\nb"), r"a\nb");
        assert_eq!(repair_escapes(r#"say \"hi\""#), r#"say \"hi\""#);
        assert_eq!(repair_escapes(r"c:\\dir"), r"c:\\dir");
        assert_eq!(repair_escapes("trailing\\"), "trailing");
    }

    #[test]
    fn test_strip_control_chars() {
        assert_eq!(strip_control_chars("a\tb\u{0}c\u{1f}d"), "abcd");
        assert_eq!(strip_control_chars("A-->B é"), "A-->B é");
    }

    #[test]
    fn test_trim_to_diagram_start() {
        assert_eq!(
            trim_to_diagram_start("noise line\nflowchart TD\nA-->B"),
            "flowchart TD\nA-->B"
        );
        assert_eq!(
            trim_to_diagram_start("Sure!\n   graph LR\nA-->B"),
            "   graph LR\nA-->B"
        );
        assert_eq!(trim_to_diagram_start("nothing to see\nhere"), "");
    }

    #[test]
    fn test_no_diagram_keyword_is_empty_definition() {
        let raw = "{\"diagramType\": \"pie\", \"explanation\": \"x\", \"definitionText\": `just words`}";
        assert_eq!(sanitize(raw).unwrap_err(), SanitizeError::EmptyDefinition);

        let raw = r#"{"diagramType": "pie", "explanation": "x", "definitionText": "   "}"#;
        assert_eq!(sanitize(raw).unwrap_err(), SanitizeError::EmptyDefinition);
    }

    #[test]
    fn test_invalid_json_keeps_payload() {
        let raw = r#"{"diagramType": "pie", "definitionText": "pie"#;
        match sanitize(raw).unwrap_err() {
            SanitizeError::Sanitization { message, payload } => {
                assert!(message.contains("invalid JSON"), "got: {}", message);
                assert_eq!(payload, raw);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_schema_violations_are_listed() {
        let raw = r#"{"diagramType": "mindmap", "definitionText": "mindmap\n root"}"#;
        match sanitize(raw).unwrap_err() {
            SanitizeError::Sanitization { message, .. } => {
                assert!(
                    message.starts_with("the create_mermaid_diagram arguments"),
                    "got: {}",
                    message
                );
                assert!(message.contains("- `diagramType`: "), "got: {}", message);
                assert!(message.contains("explanation"), "got: {}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_null_title_is_ignored() {
        let raw = r#"{"title": null, "diagramType": "gantt", "explanation": "", "definitionText": "gantt\ntitle Plan"}"#;
        let diagram = sanitize(raw).unwrap();
        assert!(diagram.title.is_none());
        assert_eq!(diagram.diagram_type, DiagramType::Gantt);
    }
}
