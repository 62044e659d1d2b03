//! Line protocol spoken with a compute child process.
//!
//! The parent writes one JSON object per line on the child's stdin. The child
//! may print any number of diagnostic lines on stdout, then exactly one
//! terminal line: `RESULT:<float>` or the literal `EXCEPTION`.
//!
//! There are no request ids, so a channel carries at most one request at a time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const RESULT_PREFIX: &str = "RESULT:";
pub const EXCEPTION_SENTINEL: &str = "EXCEPTION";

/// Arguments for one ranking call.
///
/// The child treats this as an opaque bag; anything in `params` is passed
/// through at the top level of the JSON object.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RankRequest {
    pub prompt: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    /// Image the score is computed against, if not the one being generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,

    /// Where the child writes the generated PNG, if it produces one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl RankRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// One line read back from the child.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Result(f64),
    Exception,
    /// Log chatter; never data
    Diagnostic(String),
}

impl Frame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Diagnostic(_))
    }
}

/// Serialize a request as a single newline-terminated line.
pub fn encode_request(request: &RankRequest) -> Result<String> {
    // serde_json escapes newlines inside strings, so the output is one line.
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

/// Classify one line of child output.
pub fn decode_line(line: &str) -> Result<Frame> {
    let line = line.trim();
    if line == EXCEPTION_SENTINEL {
        return Ok(Frame::Exception);
    }
    match line.strip_prefix(RESULT_PREFIX) {
        Some(value) => value
            .trim()
            .parse::<f64>()
            .map(Frame::Result)
            .map_err(|_| Error::InvalidResult(line.to_string())),
        None => Ok(Frame::Diagnostic(line.to_string())),
    }
}

/// Child-side helper: the terminal line for a successful call.
pub fn encode_result(value: f64) -> String {
    format!("{RESULT_PREFIX}{value}")
}
