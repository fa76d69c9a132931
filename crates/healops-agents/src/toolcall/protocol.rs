//! The wire protocol between the model and the tool executor.
//!
//! The model's reply must be a JSON array of invocation objects, each
//! tagged with `tool`. Parsing is strict: unknown tools or malformed
//! arguments produce a `schema_error` outcome with hints rather than a
//! best-effort guess.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One tool invocation from the fixed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolInvocation {
    /// Read a file from the workspace or repo.
    ReadFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<u32>,
    },
    /// Write workspace file content (never committed to the repo).
    WriteFile { path: String, content: String },
    /// Replace one occurrence of `find` with `replace` in a file.
    ApplyIncrementalEdit {
        path: String,
        find: String,
        replace: String,
    },
    /// Check syntax-level sanity of a file (or provided content).
    ValidateCode {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Locate where a symbol is defined.
    FindSymbolDefinition {
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
    },
    /// Update a plan step's status in the workspace todo.
    UpdateTodo {
        step_number: u32,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    /// Retrieve past fixes and error patterns for a fingerprint.
    RetrieveMemory { error_signature: String },
    /// List repository files under a directory.
    ListFiles {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_depth: Option<u32>,
    },
}

impl ToolInvocation {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::ApplyIncrementalEdit { .. } => "apply_incremental_edit",
            Self::ValidateCode { .. } => "validate_code",
            Self::FindSymbolDefinition { .. } => "find_symbol_definition",
            Self::UpdateTodo { .. } => "update_todo",
            Self::RetrieveMemory { .. } => "retrieve_memory",
            Self::ListFiles { .. } => "list_files",
        }
    }
}

/// Classified failure modes of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Quota,
    ExecutionError,
    SchemaError,
    PathError,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Quota => "quota",
            Self::ExecutionError => "execution_error",
            Self::SchemaError => "schema_error",
            Self::PathError => "path_error",
        };
        write!(f, "{s}")
    }
}

/// Result of one invocation within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole batch. `files` carries every workspace file written
/// during the batch, which is the workspace update contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_hints: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub outcomes: Vec<ToolOutcome>,
}

impl BatchOutcome {
    pub fn failure(error_type: ErrorType, error: impl Into<String>, hints: Vec<String>) -> Self {
        Self {
            success: false,
            result: String::new(),
            error: Some(error.into()),
            error_type: Some(error_type),
            error_hints: hints,
            files: BTreeMap::new(),
            outcomes: Vec::new(),
        }
    }
}

/// Parse a model reply into a tool batch: a raw JSON array, or one inside
/// a fenced block. A single bare object is accepted as a batch of one.
pub fn parse_tool_batch(reply: &str) -> Result<Vec<ToolInvocation>, BatchOutcome> {
    let text = pipeline::planner::parse::extract_json_array(reply);
    let attempt = serde_json::from_str::<Vec<ToolInvocation>>(&text)
        .or_else(|first_err| {
            let repaired = pipeline::planner::parse::repair_invalid_escapes(&text);
            serde_json::from_str::<Vec<ToolInvocation>>(&repaired).map_err(|_| first_err)
        })
        .or_else(|first_err| {
            // A single invocation object without the array wrapper.
            match crate::llm::extract_json_object(reply) {
                Some(obj) => serde_json::from_str::<ToolInvocation>(&obj)
                    .map(|one| vec![one])
                    .map_err(|_| first_err),
                None => Err(first_err),
            }
        });
    attempt.map_err(|e| {
        BatchOutcome::failure(
            ErrorType::SchemaError,
            format!("tool batch did not match the schema: {e}"),
            vec![
                "Reply with a JSON array of tool invocations only.".to_string(),
                "Each invocation must carry a \"tool\" field naming one of: read_file, \
                 write_file, apply_incremental_edit, validate_code, find_symbol_definition, \
                 update_todo, retrieve_memory, list_files."
                    .to_string(),
            ],
        )
    })
}

/// The JSON schema of a tool batch, embedded in the acting prompt so the
/// model knows the exact contract.
pub fn tool_batch_schema_json() -> String {
    let schema = schemars::schema_for!(Vec<ToolInvocation>);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "[]".to_string())
}
