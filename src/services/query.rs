//! Statements submitted to the JSON query endpoint.

use serde::Deserialize;
use std::fmt;

/// A query as posted by clients: `{"SQL": "...", "viscols": 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Statement {
    #[serde(rename = "SQL")]
    pub sql: String,
    /// Non-zero when the result should carry column names.
    #[serde(rename = "viscols", default)]
    pub visible_columns: u8,
}

impl Statement {
    pub fn from_json(body: &[u8]) -> Result<Self, QueryError> {
        serde_json::from_slice(body).map_err(QueryError::Malformed)
    }

    pub fn shows_columns(&self) -> bool {
        self.visible_columns != 0
    }
}

#[derive(Debug)]
pub enum QueryError {
    Malformed(serde_json::Error),
    Unavailable,
    Failed(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Malformed(e) => write!(f, "malformed statement: {e}"),
            QueryError::Unavailable => write!(f, "query service unavailable"),
            QueryError::Failed(reason) => write!(f, "query failed: {reason}"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs statements and renders the result as a JSON document. Called on the
/// worker that handles the request.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, statement: &Statement) -> Result<String, QueryError>;
}
