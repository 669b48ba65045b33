//! Loads SQL text from `<sql_dir>/<namespace>/<file>`.

use crate::services::error::{ClientError, ClientResult};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info};

/// Logical SQL file namespaces, one per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Relational,
    Warehouse,
}

impl Namespace {
    fn dir_name(self) -> &'static str {
        match self {
            Namespace::Relational => "relational",
            Namespace::Warehouse => "warehouse",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlFiles {
    root: PathBuf,
}

impl SqlFiles {
    pub fn new(sql_dir: &Path, namespace: Namespace) -> Self {
        Self {
            root: sql_dir.join(namespace.dir_name()),
        }
    }

    /// Rejects names that could escape the namespace directory.
    fn ensure_name_safe(name: &str) -> ClientResult<()> {
        if name.is_empty()
            || name.contains("..")
            || name.contains('/')
            || name.contains('\\')
            || name.bytes().any(|b| b.is_ascii_control())
        {
            return Err(ClientError::InvalidFileName(name.to_string()));
        }
        Ok(())
    }

    pub fn path_of(&self, name: &str) -> ClientResult<PathBuf> {
        Self::ensure_name_safe(name)?;
        Ok(self.root.join(name))
    }

    /// Read a SQL file and return its trimmed contents.
    pub async fn load(&self, name: &str) -> ClientResult<String> {
        let path = self.path_of(name)?;
        info!(path = %path.display(), "loading sql file");

        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text.trim().to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ClientError::NotFound(path)),
            Err(err) => Err(err.into()),
        }
    }

    /// Read a file of `;`-separated statements. Empty statements are dropped.
    pub async fn load_statements(&self, name: &str) -> ClientResult<Vec<String>> {
        let text = self.load(name).await?;
        let statements = split_statements(&text);
        debug!(file = name, count = statements.len(), "split sql statements");
        Ok(statements)
    }
}

/// Split on `;` and drop blank fragments. Semicolons inside literals are not
/// supported.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
