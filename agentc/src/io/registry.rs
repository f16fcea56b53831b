//! Embedded key-document store for durable plugin state.
//!
//! Layout: `<root>/<collection>/<sha256(id)>.json`, one pretty-printed
//! [`RegistryRecord`] per file. Each collection is guarded by one
//! reader/writer lock; concurrent writes to a record are last-writer-wins.
//! Expired records are deleted when a read finds them, never by a sweeper.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::core::spec::{IsolationLevel, PluginKind};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Agents,
    Contexts,
    Credentials,
    RagResults,
    CotPlans,
    UserPreferences,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Agents,
        Collection::Contexts,
        Collection::Credentials,
        Collection::RagResults,
        Collection::CotPlans,
        Collection::UserPreferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Agents => "agents",
            Collection::Contexts => "contexts",
            Collection::Credentials => "credentials",
            Collection::RagResults => "rag_results",
            Collection::CotPlans => "cot_plans",
            Collection::UserPreferences => "user_preferences",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Owner-only permissions on Unix.
    fn is_private(self) -> bool {
        self == Collection::Credentials
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: String,
    pub collection: Collection,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RegistryRecord {
    /// A record whose expiry is at or before `now` no longer exists.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// Registered running agent, as stored in the `agents` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub plugin_id: String,
    pub plugin_version: String,
    pub name: String,
    pub kind: PluginKind,
    pub isolation: IsolationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

/// File-backed registry shared by plugin runtimes.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    locks: [RwLock<()>; 6],
}

impl Registry {
    /// Open (creating if needed) a registry rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for collection in Collection::ALL {
            let dir = root.join(collection.as_str());
            fs::create_dir_all(&dir)
                .with_context(|| format!("create registry collection {}", dir.display()))
                .map_err(Error::Registry)?;
            if collection.is_private() {
                restrict_dir(&dir).map_err(Error::Registry)?;
            }
        }
        debug!(root = %root.display(), "opened registry");
        Ok(Self {
            root,
            locks: Default::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert or replace a record. `ttl` sets an expiry relative to now.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn put(
        &self,
        collection: Collection,
        id: &str,
        fields: Map<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<RegistryRecord> {
        let created_at = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => {
                let delta = TimeDelta::from_std(ttl)
                    .map_err(|e| Error::Registry(anyhow!("ttl {ttl:?} out of range: {e}")))?;
                Some(
                    created_at
                        .checked_add_signed(delta)
                        .ok_or_else(|| Error::Registry(anyhow!("ttl {ttl:?} out of range")))?,
                )
            }
            None => None,
        };
        let record = RegistryRecord {
            id: id.to_string(),
            collection,
            fields,
            created_at,
            expires_at,
        };
        let _guard = self.write_lock(collection)?;
        self.write_record(&record).map_err(Error::Registry)?;
        Ok(record)
    }

    /// Fetch a live record. Expired records are deleted and reported absent.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn get(&self, collection: Collection, id: &str) -> Result<Option<RegistryRecord>> {
        let path = self.record_path(collection, id);
        let record = {
            let _guard = self.read_lock(collection)?;
            read_record(&path).map_err(Error::Registry)?
        };
        match record {
            Some(record) if record.is_expired(Utc::now()) => {
                self.evict(collection, id)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Remove a record; `false` if it did not exist.
    pub fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let _guard = self.write_lock(collection)?;
        remove_record(&self.record_path(collection, id)).map_err(Error::Registry)
    }

    /// Every live record in a collection, ordered by id.
    pub fn list(&self, collection: Collection) -> Result<Vec<RegistryRecord>> {
        let dir = self.root.join(collection.as_str());
        let mut records = Vec::new();
        let mut expired = Vec::new();
        {
            let _guard = self.read_lock(collection)?;
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("list {}", dir.display()))
                .map_err(Error::Registry)?;
            let now = Utc::now();
            for entry in entries {
                let path = entry
                    .with_context(|| format!("list {}", dir.display()))
                    .map_err(Error::Registry)?
                    .path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(record)) if record.is_expired(now) => expired.push(record.id),
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable record"),
                }
            }
        }
        for id in expired {
            self.evict(collection, &id)?;
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub fn register_agent(&self, agent: &AgentRecord) -> Result<RegistryRecord> {
        self.put(Collection::Agents, &agent.agent_id, to_fields(agent)?, None)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        self.get(Collection::Agents, agent_id)?
            .map(|record| from_fields(record.fields))
            .transpose()
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.list(Collection::Agents)?
            .into_iter()
            .map(|record| from_fields(record.fields))
            .collect()
    }

    pub fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        self.delete(Collection::Agents, agent_id)
    }

    pub fn store_context(&self, context_id: &str, data: Value) -> Result<RegistryRecord> {
        self.put(Collection::Contexts, context_id, single("data", data), None)
    }

    pub fn get_context(&self, context_id: &str) -> Result<Option<Value>> {
        Ok(self
            .get(Collection::Contexts, context_id)?
            .and_then(|mut record| record.fields.remove("data")))
    }

    /// Copy a context under a new id, recording where it came from.
    ///
    /// The source context is left in place.
    pub fn transfer_context(&self, from_id: &str, to_id: &str) -> Result<RegistryRecord> {
        let source = self
            .get(Collection::Contexts, from_id)?
            .ok_or_else(|| Error::Registry(anyhow!("context {from_id} not found")))?;
        let mut fields = source.fields;
        fields.insert("transferred_from".to_string(), Value::from(from_id));
        self.put(Collection::Contexts, to_id, fields, None)
    }

    /// Store a secret. The record file is readable by the owner only.
    pub fn store_credential(&self, name: &str, secret: &str) -> Result<RegistryRecord> {
        let record = self.put(
            Collection::Credentials,
            name,
            single("secret", Value::from(secret)),
            None,
        )?;
        debug!(credential = name, fingerprint = %credential_fingerprint(secret), "stored credential");
        Ok(record)
    }

    pub fn get_credential(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .get(Collection::Credentials, name)?
            .and_then(|record| record.fields.get("secret")?.as_str().map(str::to_string)))
    }

    /// Cache a retrieval result for `ttl`. A zero ttl is expired on arrival.
    pub fn store_rag_result(&self, key: &str, result: Value, ttl: Duration) -> Result<RegistryRecord> {
        self.put(Collection::RagResults, key, single("result", result), Some(ttl))
    }

    pub fn get_rag_result(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .get(Collection::RagResults, key)?
            .and_then(|mut record| record.fields.remove("result")))
    }

    pub fn store_cot_plan(&self, plan_id: &str, plan: Value) -> Result<RegistryRecord> {
        self.put(Collection::CotPlans, plan_id, single("plan", plan), None)
    }

    pub fn get_cot_plan(&self, plan_id: &str) -> Result<Option<Value>> {
        Ok(self
            .get(Collection::CotPlans, plan_id)?
            .and_then(|mut record| record.fields.remove("plan")))
    }

    pub fn store_user_preference(&self, user_id: &str, key: &str, value: Value) -> Result<RegistryRecord> {
        let mut fields = single("value", value);
        fields.insert("user_id".to_string(), Value::from(user_id));
        fields.insert("key".to_string(), Value::from(key));
        self.put(Collection::UserPreferences, &preference_id(user_id, key), fields, None)
    }

    pub fn get_user_preference(&self, user_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .get(Collection::UserPreferences, &preference_id(user_id, key))?
            .and_then(|mut record| record.fields.remove("value")))
    }

    fn evict(&self, collection: Collection, id: &str) -> Result<()> {
        let _guard = self.write_lock(collection)?;
        let path = self.record_path(collection, id);
        // Another writer may have replaced the record since it was read.
        if let Some(record) = read_record(&path).map_err(Error::Registry)?
            && record.is_expired(Utc::now())
        {
            remove_record(&path).map_err(Error::Registry)?;
            debug!(collection = %collection, "evicted expired record");
        }
        Ok(())
    }

    fn record_path(&self, collection: Collection, id: &str) -> PathBuf {
        let digest = Sha256::digest(id.as_bytes());
        self.root
            .join(collection.as_str())
            .join(format!("{}.json", hex::encode(digest)))
    }

    fn write_record(&self, record: &RegistryRecord) -> anyhow::Result<()> {
        let path = self.record_path(record.collection, &record.id);
        let mut buf = serde_json::to_vec_pretty(record).context("serialize record")?;
        buf.push(b'\n');
        if record.collection.is_private() {
            write_private(&path, &buf)
        } else {
            crate::io::write_atomic(&path, &buf)
        }
    }

    fn read_lock(&self, collection: Collection) -> Result<RwLockReadGuard<'_, ()>> {
        self.locks[collection.index()]
            .read()
            .map_err(|_| Error::Registry(anyhow!("{collection} lock poisoned")))
    }

    fn write_lock(&self, collection: Collection) -> Result<RwLockWriteGuard<'_, ()>> {
        self.locks[collection.index()]
            .write()
            .map_err(|_| Error::Registry(anyhow!("{collection} lock poisoned")))
    }
}

fn preference_id(user_id: &str, key: &str) -> String {
    format!("{user_id}\u{0}{key}")
}

fn single(name: &str, value: Value) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(name.to_string(), value);
    fields
}

fn to_fields<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value).map_err(|e| Error::Registry(e.into()))? {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::Registry(anyhow!("expected object fields, got {other}"))),
    }
}

fn from_fields<T: for<'de> Deserialize<'de>>(fields: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields))
        .context("decode record fields")
        .map_err(Error::Registry)
}

fn read_record(path: &Path) -> anyhow::Result<Option<RegistryRecord>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let record =
        serde_json::from_slice(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(record))
}

fn remove_record(path: &Path) -> anyhow::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Atomic write whose temp file is created owner-only before any byte lands.
/// Short sha256 prefix that identifies a secret in logs without revealing it.
fn credential_fingerprint(secret: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(secret.as_bytes()));
    hex.truncate(12);
    hex
}

fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("restrict {}", dir.display()))
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (tempfile::TempDir, Registry) {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::open(temp.path().join("registry")).expect("open");
        (temp, registry)
    }

    fn agent(id: &str) -> AgentRecord {
        AgentRecord {
            agent_id: id.to_string(),
            plugin_id: "echo".into(),
            plugin_version: "1.0.0".into(),
            name: "Echo".into(),
            kind: PluginKind::SingleModel,
            isolation: IsolationLevel::Process,
            artifact: None,
        }
    }

    #[test]
    fn agents_crud() {
        let (_temp, registry) = registry();
        registry.register_agent(&agent("b")).expect("register");
        registry.register_agent(&agent("a")).expect("register");
        assert_eq!(registry.get_agent("a").expect("get"), Some(agent("a")));

        let ids: Vec<String> = registry
            .list_agents()
            .expect("list")
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(registry.delete_agent("a").expect("delete"));
        assert!(!registry.delete_agent("a").expect("delete again"));
        assert_eq!(registry.get_agent("a").expect("get"), None);
    }

    #[test]
    fn last_writer_wins() {
        let (_temp, registry) = registry();
        registry.store_cot_plan("p", json!(["one"])).expect("store");
        registry.store_cot_plan("p", json!(["two"])).expect("store");
        assert_eq!(registry.get_cot_plan("p").expect("get"), Some(json!(["two"])));
    }

    #[test]
    fn expired_records_are_deleted_on_read() {
        let (_temp, registry) = registry();
        registry
            .store_rag_result("q", json!({"hits": 1}), Duration::ZERO)
            .expect("store");
        let path = registry.record_path(Collection::RagResults, "q");
        assert!(path.exists());
        assert_eq!(registry.get_rag_result("q").expect("get"), None);
        assert!(!path.exists());
    }

    #[test]
    fn list_skips_and_evicts_expired() {
        let (_temp, registry) = registry();
        registry
            .store_rag_result("stale", json!(1), Duration::ZERO)
            .expect("store");
        registry
            .store_rag_result("fresh", json!(2), Duration::from_secs(3600))
            .expect("store");
        let ids: Vec<String> = registry
            .list(Collection::RagResults)
            .expect("list")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["fresh"]);
        assert!(!registry.record_path(Collection::RagResults, "stale").exists());
    }

    #[test]
    fn ids_never_become_paths() {
        let (temp, registry) = registry();
        registry
            .store_context("../../escape", json!("x"))
            .expect("store");
        assert!(!temp.path().join("escape").exists());
        assert_eq!(
            registry.get_context("../../escape").expect("get"),
            Some(json!("x"))
        );
    }

    #[test]
    fn preferences_are_scoped_per_user() {
        let (_temp, registry) = registry();
        registry
            .store_user_preference("alice", "tone", json!("formal"))
            .expect("store");
        registry
            .store_user_preference("bob", "tone", json!("casual"))
            .expect("store");
        assert_eq!(
            registry.get_user_preference("alice", "tone").expect("get"),
            Some(json!("formal"))
        );
        assert_eq!(registry.get_user_preference("alice", "lang").expect("get"), None);
    }

    #[test]
    fn credential_fingerprint_is_a_stable_digest_prefix() {
        let fingerprint = credential_fingerprint("s3cret");
        assert_eq!(fingerprint.len(), 12);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!fingerprint.contains("s3cret"));
        assert_eq!(fingerprint, credential_fingerprint("s3cret"));
        assert_ne!(fingerprint, credential_fingerprint("s3cret2"));
        assert!(hex::encode(Sha256::digest(b"s3cret")).starts_with(&fingerprint));
    }

    #[cfg(unix)]
    #[test]
    fn credentials_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_temp, registry) = registry();
        registry.store_credential("api", "s3cret").expect("store");
        let path = registry.record_path(Collection::Credentials, "api");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert_eq!(
            registry.get_credential("api").expect("get").as_deref(),
            Some("s3cret")
        );
    }
}
