//! Wire shapes for the reference RPC methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REF_WRITE_METHOD: &str = "RefWrite";
pub const REF_READ_METHOD: &str = "RefRead";

/// A reference value together with the version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefSnapshot {
    pub value: Value,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefWriteRequest {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefWriteResponse {
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefReadRequest {
    pub key: String,
}
