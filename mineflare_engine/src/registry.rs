//! The program registry
//!
//! A process-wide catalogue of named programs, persisted one directory per
//! program under a configurable root:
//!
//! ```text
//! <root>/<name>/
//!   source.mfs       # raw program source, UTF-8
//!   metadata.json    # name, version, capabilities, defaults, timestamps
//! ```
//!
//! Writes go through a sibling temp file plus rename, so a crash mid-write
//! leaves either the old file or the new one, never a torn one. On startup
//! the registry rescans its root and rehydrates every valid entry; invalid
//! entries are logged and skipped, never deleted automatically.
//!
//! The registry also tracks in-flight invocations (a program cannot be
//! removed while one of its invocations is running) and keeps a bounded
//! most-recent-first history of invocation records.

use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};
use structured_logger::unix_ms;

use mineflare_core::{
    Json,
    agent::AgentHandle,
    error::ProgramError,
    program::{InvocationRecord, ProgramMetadata, RunOptions, validate_program_name},
};

use crate::{runner::Runner, sandbox::Sandbox};

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const SOURCE_FILE: &str = "source.mfs";
pub const METADATA_FILE: &str = "metadata.json";

/// One registered program: its source text and persisted metadata.
#[derive(Debug, Clone)]
pub struct ProgramEntry {
    pub source: String,
    pub metadata: ProgramMetadata,
}

/// A row in a [`Registry::list`] snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgramSummary {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<&'static str>,
    pub created: u64,
    pub updated: u64,
}

struct RunnerHandle {
    runner: Arc<Runner>,
    program: String,
}

struct RegistryInner {
    root: PathBuf,
    history_limit: usize,
    programs: RwLock<BTreeMap<String, ProgramEntry>>,
    running: RwLock<HashMap<String, RunnerHandle>>,
    history: RwLock<VecDeque<InvocationRecord>>,
}

/// The long-lived program catalogue. Cloning shares the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Builder for a [`Registry`], mirroring the engine's other builders.
pub struct RegistryBuilder {
    root: Option<PathBuf>,
    history_limit: usize,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            root: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Creates the root directory if needed and rehydrates existing
    /// entries.
    pub async fn build(self) -> Result<Registry, ProgramError> {
        let root = match self.root {
            Some(root) => root,
            None => std::env::current_dir()
                .map_err(|err| {
                    ProgramError::operation_failed(format!("cannot resolve cwd: {err}"))
                })?
                .join(".mineflare/programs"),
        };
        tokio::fs::create_dir_all(&root).await.map_err(|err| {
            ProgramError::operation_failed(format!(
                "cannot create registry root {}: {err}",
                root.display()
            ))
        })?;

        let registry = Registry {
            inner: Arc::new(RegistryInner {
                root,
                history_limit: self.history_limit,
                programs: RwLock::new(BTreeMap::new()),
                running: RwLock::new(HashMap::new()),
                history: RwLock::new(VecDeque::new()),
            }),
        };
        registry.rehydrate().await?;
        Ok(registry)
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Registers a new program. The source is validated in a throwaway
    /// sandbox before anything is written.
    pub async fn add(&self, name: &str, source: &str) -> Result<ProgramMetadata, ProgramError> {
        validate_program_name(name)?;
        if self.inner.programs.read().contains_key(name) {
            return Err(ProgramError::invalid_argument(format!(
                "program {name} already exists"
            )));
        }
        let definition = Sandbox::validate(source).await?;
        let now = unix_ms();
        let metadata = ProgramMetadata {
            name: name.to_string(),
            version: definition.version,
            capabilities: definition.capabilities,
            defaults: definition.defaults,
            created: now,
            updated: now,
        };
        self.write_entry(name, source, &metadata).await?;
        self.inner.programs.write().insert(
            name.to_string(),
            ProgramEntry {
                source: source.to_string(),
                metadata: metadata.clone(),
            },
        );
        log::info!(program = name; "program added");
        Ok(metadata)
    }

    /// Replaces an existing program's source, revalidating and bumping the
    /// update timestamp.
    pub async fn update(&self, name: &str, source: &str) -> Result<ProgramMetadata, ProgramError> {
        let created = self
            .inner
            .programs
            .read()
            .get(name)
            .map(|entry| entry.metadata.created)
            .ok_or_else(|| {
                ProgramError::invalid_argument(format!("program {name} not found"))
            })?;
        let definition = Sandbox::validate(source).await?;
        let metadata = ProgramMetadata {
            name: name.to_string(),
            version: definition.version,
            capabilities: definition.capabilities,
            defaults: definition.defaults,
            created,
            updated: unix_ms(),
        };
        self.write_entry(name, source, &metadata).await?;
        self.inner.programs.write().insert(
            name.to_string(),
            ProgramEntry {
                source: source.to_string(),
                metadata: metadata.clone(),
            },
        );
        log::info!(program = name; "program updated");
        Ok(metadata)
    }

    /// Deletes a program and its on-disk directory. Refused while any of
    /// its invocations is running.
    pub async fn remove(&self, name: &str) -> Result<(), ProgramError> {
        if !self.inner.programs.read().contains_key(name) {
            return Err(ProgramError::invalid_argument(format!(
                "program {name} not found"
            )));
        }
        if self
            .inner
            .running
            .read()
            .values()
            .any(|handle| handle.program == name)
        {
            return Err(ProgramError::operation_failed(format!(
                "program {name} has a running invocation"
            )));
        }
        let dir = self.inner.root.join(name);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(ProgramError::operation_failed(format!(
                "cannot remove {}: {err}",
                dir.display()
            )));
        }
        self.inner.programs.write().remove(name);
        log::info!(program = name; "program removed");
        Ok(())
    }

    /// Snapshot of all registered programs.
    pub fn list(&self) -> Vec<ProgramSummary> {
        self.inner
            .programs
            .read()
            .values()
            .map(|entry| ProgramSummary {
                name: entry.metadata.name.clone(),
                version: entry.metadata.version.clone(),
                capabilities: entry.metadata.capabilities.names(),
                created: entry.metadata.created,
                updated: entry.metadata.updated,
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<ProgramEntry, ProgramError> {
        self.inner
            .programs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProgramError::invalid_argument(format!("program {name} not found")))
    }

    /// Runs a registered program to completion and returns its terminal
    /// invocation record. The invocation is tracked while in flight and
    /// moved into the bounded history afterwards.
    pub async fn run(
        &self,
        agent: Arc<dyn AgentHandle>,
        name: &str,
        args: Json,
        options: RunOptions,
    ) -> Result<InvocationRecord, ProgramError> {
        let entry = self.get(name)?;
        let runner = Arc::new(Runner::new(name, args));
        let invocation_id = runner.invocation_id();
        self.inner.running.write().insert(
            invocation_id.clone(),
            RunnerHandle {
                runner: runner.clone(),
                program: name.to_string(),
            },
        );

        let report = runner
            .run(agent, &entry.source, &entry.metadata, options)
            .await;

        self.inner.running.write().remove(&invocation_id);
        {
            let mut history = self.inner.history.write();
            if history.len() == self.inner.history_limit {
                history.pop_front();
            }
            history.push_back(report.record.clone());
        }
        Ok(report.record)
    }

    /// Cancels an in-flight invocation. The terminal CANCELLED record lands
    /// in history when the runner unwinds.
    pub fn cancel(&self, invocation_id: &str) -> Result<(), ProgramError> {
        let running = self.inner.running.read();
        let handle = running.get(invocation_id).ok_or_else(|| {
            ProgramError::invalid_argument(format!(
                "no running invocation {invocation_id}"
            ))
        })?;
        handle.runner.cancel();
        Ok(())
    }

    /// Looks up an invocation among in-flight runners first, then history.
    pub fn get_status(&self, invocation_id: &str) -> Option<InvocationRecord> {
        if let Some(handle) = self.inner.running.read().get(invocation_id) {
            return Some(handle.runner.record());
        }
        self.inner
            .history
            .read()
            .iter()
            .rev()
            .find(|record| record.invocation_id == invocation_id)
            .cloned()
    }

    /// Snapshot of in-flight invocations.
    pub fn get_running(&self) -> Vec<InvocationRecord> {
        self.inner
            .running
            .read()
            .values()
            .map(|handle| handle.runner.record())
            .collect()
    }

    /// Most-recent-first history, up to `limit` records.
    pub fn get_history(&self, limit: usize) -> Vec<InvocationRecord> {
        self.inner
            .history
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    async fn write_entry(
        &self,
        name: &str,
        source: &str,
        metadata: &ProgramMetadata,
    ) -> Result<(), ProgramError> {
        let dir = self.inner.root.join(name);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            ProgramError::operation_failed(format!("cannot create {}: {err}", dir.display()))
        })?;
        let metadata_bytes = serde_json::to_vec_pretty(metadata).map_err(|err| {
            ProgramError::operation_failed(format!("cannot serialize metadata: {err}"))
        })?;
        // Source first, metadata last: rehydration requires both files, so
        // a crash between the two renames leaves no readable entry of mixed
        // provenance with a newer metadata stamp.
        write_atomic(&dir, SOURCE_FILE, source.as_bytes()).await?;
        write_atomic(&dir, METADATA_FILE, &metadata_bytes).await?;
        Ok(())
    }

    async fn rehydrate(&self) -> Result<(), ProgramError> {
        let mut dirs = tokio::fs::read_dir(&self.inner.root).await.map_err(|err| {
            ProgramError::operation_failed(format!(
                "cannot read registry root {}: {err}",
                self.inner.root.display()
            ))
        })?;
        let mut programs = BTreeMap::new();
        while let Some(dir_entry) = dirs.next_entry().await.map_err(|err| {
            ProgramError::operation_failed(format!("cannot scan registry root: {err}"))
        })? {
            let path = dir_entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().to_string();
            match load_entry(&path, &name).await {
                Ok(entry) => {
                    programs.insert(name, entry);
                }
                Err(err) => {
                    log::warn!(
                        program = name.as_str(),
                        error = err.to_string().as_str();
                        "skipping invalid registry entry"
                    );
                }
            }
        }
        let count = programs.len();
        *self.inner.programs.write() = programs;
        if count > 0 {
            log::info!(count = count; "registry rehydrated");
        }
        Ok(())
    }
}

async fn load_entry(dir: &Path, name: &str) -> Result<ProgramEntry, ProgramError> {
    validate_program_name(name)?;
    let source = tokio::fs::read_to_string(dir.join(SOURCE_FILE))
        .await
        .map_err(|err| ProgramError::operation_failed(format!("missing source: {err}")))?;
    let metadata_bytes = tokio::fs::read(dir.join(METADATA_FILE))
        .await
        .map_err(|err| ProgramError::operation_failed(format!("missing metadata: {err}")))?;
    let metadata: ProgramMetadata = serde_json::from_slice(&metadata_bytes)
        .map_err(|err| ProgramError::operation_failed(format!("invalid metadata: {err}")))?;
    if metadata.name != name {
        return Err(ProgramError::invalid_argument(format!(
            "metadata name {:?} does not match directory {name:?}",
            metadata.name
        )));
    }
    Ok(ProgramEntry { source, metadata })
}

async fn write_atomic(dir: &Path, file: &str, bytes: &[u8]) -> Result<(), ProgramError> {
    let tmp = dir.join(format!(".{file}.tmp"));
    let target = dir.join(file);
    tokio::fs::write(&tmp, bytes).await.map_err(|err| {
        ProgramError::operation_failed(format!("cannot write {}: {err}", tmp.display()))
    })?;
    tokio::fs::rename(&tmp, &target).await.map_err(|err| {
        ProgramError::operation_failed(format!("cannot rename into {}: {err}", target.display()))
    })?;
    Ok(())
}
