//! File-backed watch source.
//!
//! Reads a JSON manifest of credential, declaration and function records,
//! applies it to a [`MemoryCache`] and forwards the resulting events. The
//! manifest is re-read every resync period; records missing from a newer
//! read are deleted.

use base64::Engine;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    CredentialRecord, DeclarationRecord, EventSink, FunctionRecord, MemoryCache, WatchEvent,
    DECLARATION_TYPE,
};
use crate::types::{Error, Result};

/// On-disk manifest layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub credentials: Vec<CredentialEntry>,
    pub declarations: Vec<DeclarationEntry>,
    pub functions: Vec<FunctionEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialEntry {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    /// Base64-encoded values.
    pub data: BTreeMap<String, String>,
    /// Plain-text values; win over `data` on key collision.
    pub string_data: BTreeMap<String, String>,
    pub deleting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclarationEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(rename = "type", default = "default_decl_type")]
    pub decl_type: String,
    pub func_name: String,
    /// Argument payload, kept as written.
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
}

impl CredentialEntry {
    fn to_record(&self) -> Result<CredentialRecord> {
        let mut data = BTreeMap::new();
        for (key, encoded) in &self.data {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    Error::validation(format!(
                        "credential {}/{} field {}: {}",
                        self.namespace, self.name, key, e
                    ))
                })?;
            data.insert(key.clone(), decoded);
        }
        for (key, plain) in &self.string_data {
            data.insert(key.clone(), plain.clone().into_bytes());
        }
        Ok(CredentialRecord {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            resource_version: self.resource_version.clone(),
            labels: self.labels.clone(),
            data,
            deleting: self.deleting,
        })
    }
}

fn default_decl_type() -> String {
    DECLARATION_TYPE.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionEntry {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Invocation timeout in seconds.
    pub timeout: u64,
}

impl Manifest {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Decodable credential records. Malformed entries are logged and skipped.
    fn credential_records(&self) -> Vec<CredentialRecord> {
        self.credentials
            .iter()
            .filter_map(|entry| match entry.to_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("skip manifest entry: {}", e);
                    None
                }
            })
            .collect()
    }

    fn declaration_records(&self) -> Vec<DeclarationRecord> {
        self.declarations
            .iter()
            .map(|entry| DeclarationRecord {
                namespace: entry.namespace.clone(),
                name: entry.name.clone(),
                resource_version: entry.resource_version.clone(),
                decl_type: entry.decl_type.clone(),
                func_name: entry.func_name.clone(),
                args: entry
                    .args
                    .as_ref()
                    .map(|raw| raw.get().as_bytes().to_vec())
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn function_records(&self) -> Vec<FunctionRecord> {
        self.functions
            .iter()
            .map(|entry| FunctionRecord {
                namespace: entry.namespace.clone(),
                name: entry.name.clone(),
                resource_version: entry.resource_version.clone(),
                timeout_secs: entry.timeout,
            })
            .collect()
    }
}

/// Periodically syncs a manifest file into the cache.
#[derive(Debug)]
pub struct ManifestSource {
    path: PathBuf,
    cache: Arc<MemoryCache>,
    sink: EventSink,
    resync: Duration,
}

impl ManifestSource {
    pub fn new(path: PathBuf, cache: Arc<MemoryCache>, sink: EventSink, resync: Duration) -> Self {
        Self {
            path,
            cache,
            sink,
            resync,
        }
    }

    /// Read the manifest once and deliver every resulting change.
    ///
    /// Returns the number of events emitted. A manifest that cannot be read
    /// or parsed leaves the cache untouched. A malformed entry is skipped and
    /// keeps its previously cached record.
    pub fn sync_once(&self) -> Result<usize> {
        let manifest = Manifest::from_json_file(&self.path)?;
        let credentials = manifest.credential_records();
        let declarations = manifest.declaration_records();
        let functions = manifest.function_records();

        let mut events: Vec<WatchEvent> = Vec::new();

        // Functions first so invocations right after a declaration lands can
        // already resolve their timeout.
        let seen_fns: HashSet<(String, String)> = functions
            .iter()
            .map(|f| (f.namespace.clone(), f.name.clone()))
            .collect();
        for record in functions {
            self.cache.upsert_function(record);
        }
        for (ns, name) in self.cache.function_names() {
            if !seen_fns.contains(&(ns.clone(), name.clone())) {
                self.cache.delete_function(&ns, &name);
            }
        }

        let seen_creds: HashSet<(String, String)> = manifest
            .credentials
            .iter()
            .map(|c| (c.namespace.clone(), c.name.clone()))
            .collect();
        for record in credentials {
            events.extend(self.cache.upsert_credential(record));
        }
        for (ns, name) in self.cache.credential_names() {
            if !seen_creds.contains(&(ns.clone(), name.clone())) {
                events.extend(self.cache.delete_credential(&ns, &name));
            }
        }

        let seen_decls: HashSet<(String, String)> = declarations
            .iter()
            .map(|d| (d.namespace.clone(), d.name.clone()))
            .collect();
        for record in declarations {
            events.extend(self.cache.upsert_declaration(record));
        }
        for (ns, name) in self.cache.declaration_names() {
            if !seen_decls.contains(&(ns.clone(), name.clone())) {
                events.extend(self.cache.delete_declaration(&ns, &name));
            }
        }

        let count = events.len();
        for event in events {
            if !self.sink.send(event) {
                return Err(Error::internal("event pump stopped"));
            }
        }
        Ok(count)
    }

    /// Resync loop. Read failures are logged and retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync);
        // The first tick completes immediately; startup already synced.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sync_once() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("manifest resync delivered {} events", n),
                    Err(e) => tracing::error!("manifest resync failed ({}): {}", self.path.display(), e),
                },
            }
        }
        tracing::debug!("manifest source stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{Resource, ResourceCache, CREDENTIAL_LABEL};
    use std::io::Write;
    use tracing_test::traced_test;

    const MANIFEST: &str = r#"{
        "credentials": [
            {"namespace": "a", "name": "sec1",
             "labels": {"fngate.io/secret-type": "token"},
             "data": {"token": "czNjcjN0"}}
        ],
        "declarations": [
            {"namespace": "a", "name": "t1", "func_name": "f1",
             "args": {"token": "sec1", "tools": [{"name": "echo"}]}}
        ],
        "functions": [
            {"namespace": "a", "name": "f1", "timeout": 12}
        ]
    }"#;

    fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_manifest_decodes_records() {
        let file = write_manifest(MANIFEST);
        let manifest = Manifest::from_json_file(file.path()).unwrap();

        let creds = manifest.credential_records();
        assert_eq!(creds[0].token(), "s3cr3t");
        assert!(creds[0].labels.contains_key(CREDENTIAL_LABEL));

        let decls = manifest.declaration_records();
        assert_eq!(decls[0].decl_type, "mcp");
        let args: serde_json::Value = serde_json::from_slice(&decls[0].args).unwrap();
        assert_eq!(args["tools"][0]["name"], "echo");

        assert_eq!(manifest.function_records()[0].timeout_secs, 12);
    }

    #[test]
    fn test_string_data_is_plain() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"credentials": [{"namespace": "a", "name": "s", "string_data": {"token": "plain"}}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.credential_records()[0].token(), "plain");
    }

    #[test]
    #[traced_test]
    fn test_bad_base64_entry_is_skipped() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"credentials": [
                {"namespace": "a", "name": "bad", "data": {"token": "!!"}},
                {"namespace": "a", "name": "good", "string_data": {"token": "ok"}}
            ]}"#,
        )
        .unwrap();
        let creds = manifest.credential_records();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].name, "good");
        assert!(logs_contain("credential a/bad field token"));
    }

    #[test]
    fn test_declaration_args_kept_as_written() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"declarations": [{"namespace": "a", "name": "t1", "func_name": "f1",
                "args": {"token":"sec1","tools":[{"name":"echo","schema":{"z":1,"a":99999999999999999999}}]}}]}"#,
        )
        .unwrap();
        let args = String::from_utf8(manifest.declaration_records()[0].args.clone()).unwrap();
        assert!(args.contains(r#"{"z":1,"a":99999999999999999999}"#));
    }

    #[tokio::test]
    async fn test_malformed_credential_does_not_block_sync() {
        let file = write_manifest(&MANIFEST.replace(
            r#""credentials": ["#,
            r#""credentials": [
            {"namespace": "a", "name": "bad", "data": {"token": "!!"}},"#,
        ));
        let cache = Arc::new(MemoryCache::new(""));
        let (sink, mut cred_rx, mut decl_rx) = EventSink::detached();
        let source = ManifestSource::new(
            file.path().to_path_buf(),
            cache.clone(),
            sink,
            Duration::from_secs(30),
        );

        assert_eq!(source.sync_once().unwrap(), 2);
        assert!(cache.get_credential("a", "sec1").unwrap().is_some());
        assert!(cache.get_credential("a", "bad").unwrap().is_none());
        assert!(cred_rx.try_recv().is_ok());
        assert!(decl_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_entry_keeps_cached_record() {
        let file = write_manifest(MANIFEST);
        let cache = Arc::new(MemoryCache::new(""));
        let (sink, _cred_rx, _decl_rx) = EventSink::detached();
        let source = ManifestSource::new(
            file.path().to_path_buf(),
            cache.clone(),
            sink,
            Duration::from_secs(30),
        );
        source.sync_once().unwrap();

        std::fs::write(file.path(), MANIFEST.replace("czNjcjN0", "!!")).unwrap();
        assert_eq!(source.sync_once().unwrap(), 0);
        assert_eq!(
            cache.get_credential("a", "sec1").unwrap().unwrap().token(),
            "s3cr3t"
        );
    }

    #[tokio::test]
    async fn test_sync_diffs_against_cache() {
        let file = write_manifest(MANIFEST);
        let cache = Arc::new(MemoryCache::new(""));
        let (sink, mut cred_rx, mut decl_rx) = EventSink::detached();
        let source = ManifestSource::new(
            file.path().to_path_buf(),
            cache.clone(),
            sink,
            Duration::from_secs(30),
        );

        assert_eq!(source.sync_once().unwrap(), 2);
        assert!(matches!(
            cred_rx.try_recv().unwrap(),
            WatchEvent::Upserted(Resource::Credential(_))
        ));
        assert!(matches!(
            decl_rx.try_recv().unwrap(),
            WatchEvent::Upserted(Resource::Declaration(_))
        ));
        assert!(cache.get_function("a", "f1").unwrap().is_some());

        // Unchanged manifest delivers nothing.
        assert_eq!(source.sync_once().unwrap(), 0);

        // Removing the declaration deletes it.
        std::fs::write(
            file.path(),
            MANIFEST.replace(r#""declarations": ["#, r#""declarations": [], "unused": ["#),
        )
        .unwrap();
        assert_eq!(source.sync_once().unwrap(), 1);
        assert!(matches!(
            decl_rx.try_recv().unwrap(),
            WatchEvent::Deleted(Resource::Declaration(_))
        ));
    }

    #[test]
    fn test_unreadable_manifest_is_error() {
        let cache = Arc::new(MemoryCache::new(""));
        let (sink, _c, _d) = EventSink::detached();
        let source = ManifestSource::new(
            PathBuf::from("/nonexistent/fngate.json"),
            cache,
            sink,
            Duration::from_secs(30),
        );
        assert!(source.sync_once().is_err());
    }
}
