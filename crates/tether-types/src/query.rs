//! Shapes for the remote query surface (`ExecuteQuery`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Method name the query proxy is bound to.
pub const EXECUTE_QUERY: &str = "ExecuteQuery";

/// How the executor should run a statement and shape its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Every row, each as an array of column values.
    All,
    /// Run one or more statements, no rows.
    Execute,
    /// Every row as an array of values (no column names).
    Values,
    /// Run a single statement; rows carry the change summary.
    Run,
    /// The first row only, or no rows.
    Get,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Execute => "execute",
            Self::Values => "values",
            Self::Run => "run",
            Self::Get => "get",
        };
        f.write_str(s)
    }
}

/// Payload of an `ExecuteQuery` request. Forwarded verbatim to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(alias = "method")]
    pub mode: QueryMode,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, params: Vec<Value>, mode: QueryMode) -> Self {
        Self {
            sql: sql.into(),
            params,
            mode,
        }
    }
}

/// Result of an `ExecuteQuery` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Value>,
}
