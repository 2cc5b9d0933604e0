//! Dependency executor for a job's generation tasks.
//!
//! A job is a small directed acyclic graph of [`GenerationNode`]s
//! (script, narration, visuals, compose). The executor runs every node at
//! most once, starting a node only when each of its dependencies has
//! either succeeded, been recovered, or failed while marked optional.
//!
//! ## Architecture
//!
//! 1. **Builder** - validates ids and dependencies and rejects cycles
//! 2. **Scheduler** - owns node state and decides eligibility
//! 3. **Executor** - runs eligible nodes in parallel, applies recovery
//! 4. **Recovery** - per-job channel where fallback artifacts are published
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reelsmith::dag::{DagConfig, DagExecutor, GenerationNode, TaskType};
//! use reelsmith::job::JobContext;
//! # use reelsmith::dag::TaskHandler;
//!
//! # async fn example(handler: Arc<impl TaskHandler + 'static>) -> anyhow::Result<()> {
//! let nodes = vec![
//!     GenerationNode::new("script", TaskType::Script),
//!     GenerationNode::new("narration", TaskType::Narration).depends_on(["script"]),
//!     GenerationNode::new("visuals", TaskType::Visuals).depends_on(["script"]),
//!     GenerationNode::new("compose", TaskType::Compose).depends_on(["narration", "visuals"]),
//! ];
//!
//! let result = DagExecutor::new(DagConfig::default())
//!     .execute(nodes, handler, &JobContext::detached())
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

mod builder;
mod context;
mod executor;
mod node;
pub mod recovery;
mod scheduler;
mod state;

pub use builder::{DagBuilder, NodeIndex, TaskGraph};
pub use context::{TaskContext, UpstreamResult};
pub use executor::{DagExecutor, TaskHandler};
pub use node::{AUDIO_KEY, DEFAULT_TASK_TIMEOUT, GenerationNode, NodeState, TaskType, VISUALS_KEY};
pub use recovery::{InputRequest, InputSource, RecoveryChannel, ResolvedInput, resolve_input};
pub use scheduler::{DagConfig, DagScheduler};
pub use state::{NodeOutcome, OrchestrationProgress, OrchestrationResult};

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Vec<GenerationNode> {
        vec![
            GenerationNode::new("script", TaskType::Script),
            GenerationNode::new("narration", TaskType::Narration).depends_on(["script"]),
            GenerationNode::new("visuals", TaskType::Visuals).depends_on(["script"]),
            GenerationNode::new("compose", TaskType::Compose).depends_on(["narration", "visuals"]),
        ]
    }

    #[test]
    fn test_pipeline_waves() {
        let nodes = pipeline();
        let graph = DagBuilder::new(&nodes).build().unwrap();
        let waves = graph.compute_waves();

        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["script"]);
        assert!(waves[1].contains(&"narration".to_string()));
        assert!(waves[1].contains(&"visuals".to_string()));
        assert_eq!(waves[2], vec!["compose"]);
    }

    #[test]
    fn test_cycle_detection() {
        let nodes = vec![
            GenerationNode::new("a", TaskType::Script).depends_on(["c"]),
            GenerationNode::new("b", TaskType::Script).depends_on(["a"]),
            GenerationNode::new("c", TaskType::Script).depends_on(["b"]),
        ];
        let err = DagScheduler::from_nodes(nodes).unwrap_err().to_string();
        assert!(err.contains("Cycle"));
    }

    #[test]
    fn test_missing_dependency() {
        let nodes = vec![GenerationNode::new("a", TaskType::Script).depends_on(["nonexistent"])];
        let err = DagScheduler::from_nodes(nodes).unwrap_err().to_string();
        assert!(err.contains("Unknown dependency"));
        assert!(err.contains("nonexistent"));
    }
}
