//! Recovery channel: where fallback artifacts of failed tasks become
//! visible to the tasks that depend on them.
//!
//! A failed task never fills its own result slot. When the executor
//! recovers it, the fallback is published here under the task id and
//! under the node's canonical key (e.g. every narration variant collapses
//! onto `"audio"`). Consumers resolve inputs with [`resolve_input`], which
//! checks the direct upstream result first, then the canonical key, then a
//! cached fallback on disk.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reelsmith_common::ErrorCode;

use crate::artifact::Artifact;
use crate::dag::context::TaskContext;
use crate::dag::node::NodeState;
use crate::errors::TaskError;

/// Per-job keyed store of fallback artifacts. Cloning shares the store.
#[derive(Debug, Clone, Default)]
pub struct RecoveryChannel {
    entries: Arc<DashMap<String, Artifact>>,
}

/// Outcome of a publish: the task-id slot is write-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Stored,
    /// The task id already had a fallback; only the canonical key was updated.
    TaskSlotTaken,
}

impl RecoveryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fallback for `task_id`, and under `canonical_key` when given.
    ///
    /// The task-id entry is written at most once. The canonical key is
    /// deliberately overwritable so the latest recovered producer wins.
    pub fn publish(
        &self,
        task_id: &str,
        canonical_key: Option<&str>,
        artifact: Artifact,
    ) -> Published {
        let outcome = match self.entries.entry(task_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(artifact.clone());
                Published::Stored
            }
            Entry::Occupied(_) => Published::TaskSlotTaken,
        };
        if let Some(key) = canonical_key.filter(|k| *k != task_id) {
            self.entries.insert(key.to_string(), artifact);
        }
        outcome
    }

    pub fn get(&self, key: &str) -> Option<Artifact> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Called once the job is terminal.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Where a resolved input came from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Direct { task_id: String },
    Recovery { key: String },
    CachedFallback { path: PathBuf },
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { task_id } => write!(f, "direct result of '{}'", task_id),
            Self::Recovery { key } => write!(f, "recovery channel key '{}'", key),
            Self::CachedFallback { path } => write!(f, "cached fallback {}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub artifact: Artifact,
    pub source: InputSource,
}

/// What a consumer is looking for.
pub struct InputRequest<'a> {
    /// Human label used in error messages, e.g. "narration audio".
    pub label: &'a str,
    pub producer: &'a str,
    pub canonical_key: &'a str,
    /// Optional on-disk fallback, checked last.
    pub cached_fallback: Option<PathBuf>,
    /// Builds an artifact from the cached file.
    pub from_cache: fn(PathBuf) -> Artifact,
    /// Error code when every source comes up empty.
    pub missing_code: ErrorCode,
}

/// Resolve an input in priority order: direct upstream result, recovery
/// channel canonical key, cached fallback. Fails with a message naming
/// each source checked and what it held.
pub fn resolve_input(ctx: &TaskContext, req: InputRequest<'_>) -> Result<ResolvedInput, TaskError> {
    let mut checked = Vec::with_capacity(3);

    match ctx.upstream(req.producer) {
        Some(up) if up.state == NodeState::Succeeded => {
            if let Some(artifact) = up.result.clone() {
                return Ok(ResolvedInput {
                    artifact,
                    source: InputSource::Direct {
                        task_id: req.producer.to_string(),
                    },
                });
            }
            checked.push(format!("direct result of '{}' was empty", req.producer));
        }
        Some(up) => checked.push(format!(
            "direct result of '{}' was empty (task {})",
            req.producer,
            up.state.as_str()
        )),
        None => checked.push(format!("'{}' is not an upstream task", req.producer)),
    }

    match ctx.recovery().get(req.canonical_key) {
        Some(artifact) => {
            return Ok(ResolvedInput {
                artifact,
                source: InputSource::Recovery {
                    key: req.canonical_key.to_string(),
                },
            });
        }
        None => checked.push(format!(
            "recovery channel key '{}' had no entry",
            req.canonical_key
        )),
    }

    match req.cached_fallback {
        Some(path) if path.is_file() => {
            return Ok(ResolvedInput {
                artifact: (req.from_cache)(path.clone()),
                source: InputSource::CachedFallback { path },
            });
        }
        Some(path) => checked.push(format!("cached fallback {} does not exist", path.display())),
        None => checked.push("no cached fallback configured".to_string()),
    }

    Err(TaskError::new(
        req.missing_code,
        format!(
            "{} unavailable for task {}: {}",
            req.label,
            ctx.task_id(),
            checked.join("; ")
        ),
    ))
}
