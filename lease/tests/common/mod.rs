#![allow(dead_code)]

use async_trait::async_trait;
use lease::{
    ArbitrationContext, ArbitrationVerdict, ConfigStore, HealthReport, LeaseAgent, LeaseAgentConfiguration,
    LeaseConfig, LeaseHarness, LeasingApplication, SecuritySettings,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Leasing application that records every callback.
pub struct RecordingApp {
    verdict: Mutex<ArbitrationVerdict>,
    pub lease_failed: Mutex<usize>,
    pub remote_failed: Mutex<Vec<String>>,
    pub arbitrations: Mutex<Vec<ArbitrationContext>>,
    pub health_reports: Mutex<Vec<HealthReport>>,
}

impl RecordingApp {
    pub fn new(verdict: ArbitrationVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict: Mutex::new(verdict),
            lease_failed: Mutex::new(0),
            remote_failed: Mutex::new(Vec::new()),
            arbitrations: Mutex::new(Vec::new()),
            health_reports: Mutex::new(Vec::new()),
        })
    }

    pub fn conceding() -> Arc<Self> {
        Self::new(ArbitrationVerdict::concede())
    }
}

#[async_trait]
impl LeasingApplication for RecordingApp {
    fn on_lease_failed(&self) {
        *self.lease_failed.lock() += 1;
    }

    fn on_remote_leasing_application_failed(&self, remote_id: &str) {
        self.remote_failed.lock().push(remote_id.to_string());
    }

    async fn arbitrate(&self, context: ArbitrationContext) -> ArbitrationVerdict {
        self.arbitrations.lock().push(context);
        *self.verdict.lock()
    }

    fn on_health_report(&self, report: &HealthReport) {
        self.health_reports.lock().push(report.clone());
    }
}

pub struct TestNode {
    pub agent: LeaseAgent,
    pub app: Arc<RecordingApp>,
    pub store: Arc<ConfigStore>,
}

impl TestNode {
    pub fn address(id: &str) -> String {
        format!("{}:9000", id)
    }
}

pub struct NodeBuilder<'a> {
    harness: &'a LeaseHarness,
    id: String,
    config: LeaseConfig,
    arbitration_enabled: bool,
    security: SecuritySettings,
    app: Arc<RecordingApp>,
}

impl<'a> NodeBuilder<'a> {
    pub fn new(harness: &'a LeaseHarness, id: &str) -> Self {
        Self {
            harness,
            id: id.to_string(),
            config: LeaseConfig::default(),
            arbitration_enabled: true,
            security: SecuritySettings::unsecured(),
            app: RecordingApp::conceding(),
        }
    }

    pub fn config(mut self, config: LeaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn arbitration_enabled(mut self, enabled: bool) -> Self {
        self.arbitration_enabled = enabled;
        self
    }

    pub fn security(mut self, security: SecuritySettings) -> Self {
        self.security = security;
        self
    }

    pub fn app(mut self, app: Arc<RecordingApp>) -> Self {
        self.app = app;
        self
    }

    pub fn build(self) -> TestNode {
        let store = ConfigStore::new(self.config).unwrap();
        let config = LeaseAgentConfiguration::new(
            self.id.clone(),
            TestNode::address(&self.id),
            self.arbitration_enabled,
            &store.snapshot(),
        );
        let agent = LeaseAgent::new(
            config,
            Arc::clone(&store),
            Arc::new(self.harness.clone()),
            self.app.clone(),
            self.security,
        );
        TestNode {
            agent,
            app: self.app,
            store,
        }
    }

    pub fn open(self) -> TestNode {
        let node = self.build();
        node.agent.open().unwrap();
        node
    }
}

/// Lets queued callbacks and short timers run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
