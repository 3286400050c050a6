//! Handler registry: maps job types to the code that executes them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::job::{JobParams, JobType};

/// A unit of background work.
///
/// Handlers receive their typed parameters and a [`JobContext`] for
/// progress, logging, heartbeats, cancellation checks, child jobs and
/// named locks. The return value becomes the job's stored result.
///
/// Returning `Err` fails the job; the error is classified into a terse
/// persisted record while the full chain goes to the operational log.
/// Handlers that observe a cancellation request should stop and return
/// `Ok` with whatever partial result makes sense; the runner finalizes
/// the job as cancelled either way.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Immutable set of handlers a worker process serves.
///
/// Built once at startup; a job type with no entry here fails as
/// `no_handler` rather than being silently dropped or requeued.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn run(
            &self,
            _params: JobParams,
            _ctx: &JobContext,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn lookup_respects_registration() {
        let registry = HandlerRegistry::new().register(JobType::ParseDocuments, Arc::new(Noop));
        assert!(registry.is_registered(JobType::ParseDocuments));
        assert!(!registry.is_registered(JobType::GenerateReport));
        assert!(registry.get(JobType::ParseDocuments).is_some());
        assert_eq!(registry.registered_types(), vec![JobType::ParseDocuments]);
    }
}
