//! The diagram function offered to the model

use std::fmt;
use std::str::FromStr;

use diagen_ai::Tool;
use serde::{Deserialize, Serialize};

/// Name of the function the model is asked to call
pub const FUNCTION_NAME: &str = "create_mermaid_diagram";

/// Mermaid diagram families the model may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagramType {
    #[serde(rename = "flowchart")]
    Flowchart,
    #[serde(rename = "sequence")]
    Sequence,
    #[serde(rename = "gantt")]
    Gantt,
    #[serde(rename = "class")]
    Class,
    #[serde(rename = "state")]
    State,
    #[serde(rename = "pie")]
    Pie,
    #[serde(rename = "git")]
    Git,
    #[serde(rename = "entityRelationship")]
    EntityRelationship,
    #[serde(rename = "user-journey")]
    UserJourney,
    #[serde(rename = "requirement")]
    Requirement,
}

impl DiagramType {
    /// All diagram types, in the order advertised to the model
    pub const ALL: [DiagramType; 10] = [
        DiagramType::Flowchart,
        DiagramType::Sequence,
        DiagramType::Gantt,
        DiagramType::Class,
        DiagramType::State,
        DiagramType::Pie,
        DiagramType::Git,
        DiagramType::EntityRelationship,
        DiagramType::UserJourney,
        DiagramType::Requirement,
    ];

    /// Wire name used in the function schema
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagramType::Flowchart => "flowchart",
            DiagramType::Sequence => "sequence",
            DiagramType::Gantt => "gantt",
            DiagramType::Class => "class",
            DiagramType::State => "state",
            DiagramType::Pie => "pie",
            DiagramType::Git => "git",
            DiagramType::EntityRelationship => "entityRelationship",
            DiagramType::UserJourney => "user-journey",
            DiagramType::Requirement => "requirement",
        }
    }
}

impl fmt::Display for DiagramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagramType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiagramType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown diagram type: {}", s))
    }
}

/// JSON schema of the function parameters
pub fn parameters_schema() -> serde_json::Value {
    let types: Vec<&str> = DiagramType::ALL.iter().map(|t| t.as_str()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {
                "type": "string",
                "description": "Title of the mermaid diagram"
            },
            "diagramType": {
                "type": "string",
                "enum": types,
                "description": "Type of mermaid diagram to be created."
            },
            "explanation": {
                "type": "string",
                "description": "Explanation of the diagram and its components"
            },
            "definitionText": {
                "type": "string",
                "description": "Mermaid definition as plain text, properly escaped for embedding in JSON"
            }
        },
        "required": ["diagramType", "explanation", "definitionText"]
    })
}

/// The function definition sent with every completion
pub fn diagram_function() -> Tool {
    Tool::new(
        FUNCTION_NAME,
        "Generate a mermaid diagram from a mermaid text based script",
        parameters_schema(),
    )
}
