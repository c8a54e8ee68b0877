//! Declaration payload decoding.
//!
//! Two payload shapes are accepted:
//!   - `{"token": "<credential>", "tools": [{"name", "desc", "schema"}, ...]}`
//!   - `{"toolset": "<credential>", "desc": ..., "schema": ...}`, a single tool
//!     named after the declaration record.
//!
//! `tools[]` is the primary shape. When both references are present, `token`
//! wins and `toolset` is ignored.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::{ConfigKey, Error, Result, ScopeKey};
use crate::watch::DeclarationRecord;

/// One tool as declared in a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Input schema exactly as declared; `None` when undeclared or `null`.
    #[serde(default)]
    pub schema: Option<Box<RawValue>>,
}

impl ToolDef {
    /// Declared schema text, if any.
    pub fn schema_text(&self) -> Option<&str> {
        self.schema.as_deref().map(RawValue::get)
    }
}

impl PartialEq for ToolDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.desc == other.desc
            && self.schema_text() == other.schema_text()
    }
}

/// Decoded declaration: the tools one record contributes to one function
/// under one AuthScope.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolScopeConfig {
    pub key: ConfigKey,
    pub namespace: String,
    /// Credential record name of the owning scope.
    pub scope_name: String,
    pub function: String,
    pub tools: Vec<ToolDef>,
}

impl ToolScopeConfig {
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(&self.namespace, &self.scope_name)
    }
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    tools: Vec<ToolDef>,
    #[serde(default)]
    toolset: Option<String>,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    schema: Option<Box<RawValue>>,
}

/// Decode a declaration record's argument payload.
///
/// Fails with [`Error::ConfigParse`] when the payload is not JSON or names
/// no owning credential.
pub fn decode_declaration(record: &DeclarationRecord) -> Result<ToolScopeConfig> {
    let payload: Payload = serde_json::from_slice(&record.args).map_err(|e| {
        Error::config_parse(format!(
            "{}/{} tool config: {}",
            record.namespace, record.name, e
        ))
    })?;

    let (scope_name, tools) = match (payload.token, payload.toolset) {
        (Some(token), _) if !token.is_empty() => (token, payload.tools),
        (_, Some(toolset)) if !toolset.is_empty() => (
            toolset,
            vec![ToolDef {
                name: record.name.clone(),
                desc: payload.desc,
                schema: payload.schema,
            }],
        ),
        _ => {
            return Err(Error::config_parse(format!(
                "{}/{} tool config names no credential",
                record.namespace, record.name
            )))
        }
    };

    Ok(ToolScopeConfig {
        key: record.key(),
        namespace: record.namespace.clone(),
        scope_name,
        function: record.func_name.clone(),
        tools,
    })
}
