use std::sync::Arc;

use crate::api::{HttpRequestTracker, RequestTracker};
use crate::command::{SystemRunner, ToolRunner};
use crate::error::Result;
use crate::settings::WorkerSettings;
use crate::greenwave::{GatingCheck, GreenwaveClient};
use crate::tasks::regenerate_bundle::{AnnotationsRewriter, BundleRewriter};
use crate::tasks::containerized::gitlab::{GitLabClient, MergeRequestProvider};
use crate::tasks::containerized::konflux::{KubePipelineMonitor, PipelineMonitor};

/// Everything a task handler needs, shared by reference for one worker process
#[derive(Clone)]
pub struct WorkerState {
    pub settings: Arc<WorkerSettings>,
    pub runner: Arc<dyn ToolRunner>,
    pub tracker: Arc<dyn RequestTracker>,
    pub merge_requests: Arc<dyn MergeRequestProvider>,
    pub pipelines: Arc<dyn PipelineMonitor>,
    pub gating: Arc<dyn GatingCheck>,
    pub bundle_rewriter: Arc<dyn BundleRewriter>,
}

impl WorkerState {
    /// Production wiring: host subprocesses, the IIB REST API, GitLab, Greenwave and the Kubernetes API
    pub fn new(settings: WorkerSettings) -> Result<Self> {
        let tracker = HttpRequestTracker::new(&settings)?;
        let merge_requests = GitLabClient::new(settings.api_timeout())?;
        let pipelines = KubePipelineMonitor::new(&settings);
        let gating = GreenwaveClient::new(&settings)?;
        Ok(Self {
            settings: Arc::new(settings),
            runner: Arc::new(SystemRunner),
            tracker: Arc::new(tracker),
            merge_requests: Arc::new(merge_requests),
            pipelines: Arc::new(pipelines),
            gating: Arc::new(gating),
            bundle_rewriter: Arc::new(AnnotationsRewriter::default()),
        })
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    pub fn tracker(&self) -> &dyn RequestTracker {
        self.tracker.as_ref()
    }
}
