use crate::core::{DbError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffixes marking a rollback-only script, paired by stem with its forward script
const ROLLBACK_SUFFIXES: [&str; 2] = [".rollback.sql", ".down.sql"];
const FORWARD_SUFFIXES: [&str; 2] = [".up.sql", ".sql"];

/// A forward migration and its optional rollback script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub name: String,
    pub path: PathBuf,
    pub rollback_path: Option<PathBuf>,
}

impl MigrationScript {
    pub async fn up_sql(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| DbError::migration_failed(&self.name, err))
    }

    pub async fn down_sql(&self) -> Result<String> {
        match &self.rollback_path {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|err| DbError::migration_failed(&self.name, err)),
            None => Err(DbError::migration_failed(
                &self.name,
                format!("no rollback script found (expected {}.rollback.sql)", self.name),
            )),
        }
    }
}

enum ScriptKind {
    Forward(String),
    Rollback(String),
}

fn classify(file_name: &str) -> Option<ScriptKind> {
    for suffix in ROLLBACK_SUFFIXES {
        if let Some(stem) = file_name.strip_suffix(suffix) {
            return (!stem.is_empty()).then(|| ScriptKind::Rollback(stem.to_string()));
        }
    }
    for suffix in FORWARD_SUFFIXES {
        if let Some(stem) = file_name.strip_suffix(suffix) {
            return (!stem.is_empty()).then(|| ScriptKind::Forward(stem.to_string()));
        }
    }
    None
}

/// Directory of timestamp-prefixed `.sql` migration scripts
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
}

impl MigrationSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Forward scripts in ascending name order, each paired with its rollback script
    pub fn discover(&self) -> Result<Vec<MigrationScript>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            DbError::Io(format!(
                "cannot read migrations directory '{}': {err}",
                self.dir.display()
            ))
        })?;

        let mut forward = BTreeMap::new();
        let mut rollbacks = BTreeMap::new();

        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match classify(file_name) {
                Some(ScriptKind::Forward(name)) => {
                    if let Some(previous) = forward.insert(name.clone(), path) {
                        return Err(DbError::Config(format!(
                            "migration '{name}' is defined twice (also '{}')",
                            previous.display()
                        )));
                    }
                }
                Some(ScriptKind::Rollback(name)) => {
                    rollbacks.insert(name, path);
                }
                None => {}
            }
        }

        let scripts: Vec<MigrationScript> = forward
            .into_iter()
            .map(|(name, path)| {
                if !name.starts_with(|c: char| c.is_ascii_digit()) {
                    warn!(migration = %name, "Migration name has no timestamp prefix; ordering may not be chronological");
                }
                let rollback_path = rollbacks.remove(&name);
                MigrationScript {
                    name,
                    path,
                    rollback_path,
                }
            })
            .collect();

        for orphan in rollbacks.keys() {
            warn!(migration = %orphan, "Rollback script has no matching migration");
        }

        Ok(scripts)
    }
}
