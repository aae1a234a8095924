//! Script lookup and name validation.
//!
//! Names are path components. A name is accepted only when it matches the
//! identifier grammar and the path built from it stays directly inside the
//! owner's script directory.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::accounts::RequestedCapabilities;
use crate::error::{ExecError, Result};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static pattern"))
}

pub fn validate_name(name: &str) -> Result<()> {
    if !name_pattern().is_match(name) {
        return Err(ExecError::InvalidArgument(format!("invalid name: {name:?}")));
    }
    Ok(())
}

/// Resolve `<root>/<owner>/<name>` without touching the filesystem.
pub fn script_path(root: &Path, owner: &str, name: &str) -> Result<PathBuf> {
    validate_name(owner)?;
    validate_name(name)?;
    let dir = root.join(owner);
    let path = dir.join(name);
    if path.parent() != Some(dir.as_path()) || dir.parent() != Some(root) {
        return Err(ExecError::InvalidArgument(format!(
            "{owner}/{name} escapes the script root"
        )));
    }
    Ok(path)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Sidecar metadata stored next to a script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptMeta {
    pub capabilities: RequestedCapabilities,
    pub visibility: Visibility,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub owner: String,
    pub name: String,
    /// Host path of the script file.
    pub path: PathBuf,
    pub meta: ScriptMeta,
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn open(&self, owner: &str, name: &str) -> Result<Script>;

    /// Directory holding every owner's scripts.
    fn root(&self) -> &Path;
}

/// Scripts under `<root>/<owner>/<name>` with optional `<name>.meta.json`.
pub struct FsScriptStore {
    root: PathBuf,
}

impl FsScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ScriptStore for FsScriptStore {
    async fn open(&self, owner: &str, name: &str) -> Result<Script> {
        let path = script_path(&self.root, owner, name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(ExecError::NotFound(format!("{owner}/{name}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecError::NotFound(format!("{owner}/{name}")))
            }
            Err(e) => return Err(ExecError::internal(format!("stat {}: {e}", path.display()))),
        }

        // Names never contain dots, so the sidecar cannot shadow a script.
        let meta_path = path.with_file_name(format!("{name}.meta.json"));
        let meta = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ExecError::internal(format!("{}: {e}", meta_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ScriptMeta::default(),
            Err(e) => {
                return Err(ExecError::internal(format!("read {}: {e}", meta_path.display())))
            }
        };

        Ok(Script {
            owner: owner.to_string(),
            name: name.to_string(),
            path,
            meta,
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_identifiers() {
        for name in ["hello", "a-b_c", "X9", "_"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn rejects_everything_else() {
        for name in ["", "../x", "a/b", "..", ".", "a b", "é", "a.b", "a\0b"] {
            assert!(
                matches!(validate_name(name), Err(ExecError::InvalidArgument(_))),
                "{name:?} accepted"
            );
        }
    }

    #[tokio::test]
    async fn traversal_is_invalid_argument_not_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        std::fs::create_dir_all(root.join("alice")).unwrap();
        std::fs::write(dir.path().join("secret"), "x").unwrap();

        let store = FsScriptStore::new(&root);
        let err = store.open("alice", "../../secret").await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));
        let err = store.open("..", "secret").await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(dir.path());
        let err = store.open("alice", "ghost").await.unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
    }

    #[tokio::test]
    async fn reads_sidecar_meta() {
        let dir = tempfile::tempdir().unwrap();
        let owner = dir.path().join("alice");
        std::fs::create_dir_all(&owner).unwrap();
        std::fs::write(owner.join("tip"), "#!/bin/sh\n").unwrap();
        std::fs::write(
            owner.join("tip.meta.json"),
            r#"{"capabilities": {"withdrawal_limit": 25}, "visibility": "public"}"#,
        )
        .unwrap();

        let script = FsScriptStore::new(dir.path()).open("alice", "tip").await.unwrap();
        assert_eq!(script.meta.capabilities.withdrawal_limit, 25);
        assert_eq!(script.meta.visibility, Visibility::Public);
        assert_eq!(script.path, owner.join("tip"));
    }
}
