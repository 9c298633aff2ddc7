//! Credential sources: the JSON key file and numbered environment variables
//!
//! The key file accepts three shapes:
//! - a list of objects `{"key"|"api_key"|"value": "...", "alias": "...", "rpm": n, "rpd": n}`
//! - a map of alias to key
//! - a list of bare key strings
//!
//! Entries without an alias are named `key_<n>`. Admin commands rewrite the
//! file in the first shape. Secrets taken from the environment are never
//! written to disk.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::credential::{CredentialSpec, LimitOverrides};
use crate::error::{Error, Result};
use crate::stats::write_json_atomic;

/// One record of the key file.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub key: Secret<String>,
    pub alias: String,
    pub overrides: LimitOverrides,
}

impl KeyEntry {
    pub fn spec(&self) -> CredentialSpec {
        CredentialSpec {
            secret: self.key.clone(),
            alias: self.alias.clone(),
            overrides: self.overrides,
        }
    }
}

#[derive(Serialize)]
struct StoredEntry<'a> {
    key: &'a str,
    alias: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rpd: Option<u32>,
}

/// The key file and its parsed entries.
#[derive(Debug)]
pub struct KeyFile {
    path: PathBuf,
    entries: Vec<KeyEntry>,
}

impl KeyFile {
    /// Read the key file. A missing file is an empty key set; a malformed one
    /// is a `Parse` error so that admin commands never overwrite it.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value: Value = serde_json::from_str(&contents)
                    .map_err(|e| Error::Parse(format!("parsing {}: {e}", path.display())))?;
                parse_entries(&value)
                    .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn specs(&self) -> Vec<CredentialSpec> {
        self.entries.iter().map(KeyEntry::spec).collect()
    }

    /// Append a key. Rejects blank keys and duplicates by secret or alias.
    pub fn add(
        &mut self,
        key: Secret<String>,
        alias: Option<String>,
        overrides: LimitOverrides,
    ) -> Result<&KeyEntry> {
        if key.is_blank() {
            return Err(Error::Config("API key is empty".into()));
        }
        if let Some(existing) = self.entries.iter().find(|e| e.key.expose() == key.expose()) {
            return Err(Error::Duplicate(format!(
                "key already present as {}",
                existing.alias
            )));
        }
        let alias = alias.unwrap_or_else(|| self.unused_alias());
        overrides.validate(&alias)?;
        if self.entries.iter().any(|e| e.alias == alias) {
            return Err(Error::Duplicate(format!("alias {alias} already in use")));
        }
        self.entries.push(KeyEntry {
            key,
            alias,
            overrides,
        });
        let index = self.entries.len() - 1;
        Ok(&self.entries[index])
    }

    /// First `key_<n>` not already taken.
    fn unused_alias(&self) -> String {
        (0..)
            .map(|n| format!("key_{n}"))
            .find(|candidate| self.entries.iter().all(|e| &e.alias != candidate))
            .unwrap_or_default()
    }

    /// Remove the entry with `alias`.
    pub fn remove(&mut self, alias: &str) -> Result<KeyEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.alias == alias)
            .ok_or_else(|| Error::NotFound(alias.to_string()))?;
        Ok(self.entries.remove(index))
    }

    /// Write the entries back atomically (0600).
    pub async fn save(&self) -> Result<()> {
        let stored: Vec<StoredEntry<'_>> = self
            .entries
            .iter()
            .map(|e| StoredEntry {
                key: e.key.expose(),
                alias: &e.alias,
                rpm: e.overrides.rpm,
                rpd: e.overrides.rpd,
            })
            .collect();
        write_json_atomic(&self.path, &stored).await?;
        info!(path = %self.path.display(), keys = stored.len(), "saved key file");
        Ok(())
    }
}

fn parse_entries(value: &Value) -> std::result::Result<Vec<KeyEntry>, String> {
    let mut entries = Vec::new();
    match value {
        Value::Object(map) => {
            for (alias, key) in map {
                let key = key
                    .as_str()
                    .ok_or_else(|| format!("value for {alias} is not a string"))?;
                entries.push(KeyEntry {
                    key: Secret::from(key),
                    alias: alias.clone(),
                    overrides: LimitOverrides::default(),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                // Single-item nested lists are unwrapped
                let inner = match item {
                    Value::Array(nested) => match nested.first() {
                        Some(first) => first,
                        None => continue,
                    },
                    other => other,
                };
                if let Some(entry) = parse_item(inner, entries.len())? {
                    entries.push(entry);
                }
            }
        }
        other => return Err(format!("unsupported key file shape: {}", type_name(other))),
    }
    Ok(entries)
}

fn parse_item(item: &Value, index: usize) -> std::result::Result<Option<KeyEntry>, String> {
    let default_alias = || format!("key_{index}");
    match item {
        Value::String(key) => Ok(Some(KeyEntry {
            key: Secret::from(key.as_str()),
            alias: default_alias(),
            overrides: LimitOverrides::default(),
        })),
        Value::Object(map) => {
            let Some(key) = ["key", "api_key", "value"]
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .filter(|k| !k.is_empty())
            else {
                return Ok(None);
            };
            let alias = map
                .get("alias")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .unwrap_or_else(default_alias);
            let limit = |field: &str| {
                map.get(field)
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
            };
            let overrides = LimitOverrides {
                rpm: limit("rpm"),
                rpd: limit("rpd"),
            };
            overrides.validate(&alias).map_err(|e| e.to_string())?;
            Ok(Some(KeyEntry {
                key: Secret::from(key),
                alias,
                overrides,
            }))
        }
        other => {
            warn!(kind = type_name(other), "ignoring unrecognized key file entry");
            Ok(None)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Credential records from environment variables starting with `prefix`.
///
/// The lowercased suffix is the alias. Numeric suffixes come first in numeric
/// order, then the rest alphabetically.
pub fn specs_from_vars(
    prefix: &str,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Vec<CredentialSpec> {
    let mut found: Vec<(String, String)> = vars
        .into_iter()
        .filter_map(|(name, value)| {
            let suffix = name.strip_prefix(prefix)?;
            if suffix.is_empty() || value.trim().is_empty() {
                return None;
            }
            Some((suffix.to_lowercase(), value))
        })
        .collect();
    found.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    found
        .into_iter()
        .map(|(alias, value)| CredentialSpec {
            secret: Secret::from(value),
            alias,
            overrides: LimitOverrides::default(),
        })
        .collect()
}

/// Load credential records: the key file if it yields any, otherwise the
/// process environment. `Config` error when neither does.
pub async fn load_specs(key_file: &Path, env_prefix: &str) -> Result<Vec<CredentialSpec>> {
    match KeyFile::load(key_file).await {
        Ok(file) if !file.is_empty() => {
            info!(path = %key_file.display(), keys = file.entries().len(), "loaded keys from file");
            return Ok(file.specs());
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "key file unusable, falling back to environment"),
    }

    let specs = specs_from_vars(env_prefix, std::env::vars());
    if specs.is_empty() {
        return Err(Error::Config(format!(
            "no API keys found in {} or {env_prefix}* environment variables",
            key_file.display()
        )));
    }
    info!(prefix = env_prefix, keys = specs.len(), "loaded keys from environment");
    Ok(specs)
}
