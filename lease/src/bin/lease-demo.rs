use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use futures::future::try_join;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use lease::ipc::{LeaseQueryService, LoopbackIpc};
use lease::telemetry::init_logging;
use lease::{
    ArbitrationContext, ArbitrationVerdict, ConfigStore, EstablishRequest, LeaseAgent, LeaseAgentConfiguration,
    LeaseConfig, LeaseDurationType, LeaseHarness, LeaseMonitor, LeasingApplication, SecuritySettings,
};

#[derive(Parser, Debug)]
#[command(name = "lease-demo", about = "Two lease agents over the in-memory lease driver")]
struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Lease duration in seconds
    #[arg(long, default_value_t = 10)]
    lease_duration: u64,

    /// Fault domain of the first node
    #[arg(long, default_value = "/dc1/rack1")]
    fault_domain_a: String,

    /// Fault domain of the second node
    #[arg(long, default_value = "/dc2/rack1")]
    fault_domain_b: String,

    /// Let the first node win arbitration instead of conceding
    #[arg(long)]
    prevail: bool,
}

struct DemoApp {
    name: &'static str,
    prevail: bool,
}

#[async_trait]
impl LeasingApplication for DemoApp {
    fn on_lease_failed(&self) {
        info!(node = self.name, "local lease failed");
    }

    fn on_remote_leasing_application_failed(&self, remote_id: &str) {
        info!(node = self.name, remote = remote_id, "remote failed");
    }

    async fn arbitrate(&self, context: ArbitrationContext) -> ArbitrationVerdict {
        info!(node = self.name, kind = ?context.arbitration_type, remote = %context.remote_address, "arbitration");
        if self.prevail {
            ArbitrationVerdict::prevail(Duration::from_secs(1))
        } else {
            ArbitrationVerdict::concede()
        }
    }
}

fn build_agent(
    harness: &LeaseHarness,
    store: &Arc<ConfigStore>,
    id: &'static str,
    prevail: bool,
) -> LeaseAgent {
    let config = LeaseAgentConfiguration::new(id, format!("{id}:9000"), true, &store.snapshot());
    LeaseAgent::new(
        config,
        Arc::clone(store),
        Arc::new(harness.clone()),
        Arc::new(DemoApp { name: id, prevail }),
        SecuritySettings::unsecured(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = LeaseConfig {
        lease_duration: Duration::from_secs(args.lease_duration),
        lease_duration_across_fault_domain: Duration::from_secs(args.lease_duration),
        max_lease_duration: Duration::from_secs(args.lease_duration),
        ..LeaseConfig::default()
    };
    let duration_type = LeaseDurationType::for_fault_domains(&config, &args.fault_domain_a, &args.fault_domain_b);
    let store = ConfigStore::new(config).context("invalid lease configuration")?;

    let harness = LeaseHarness::new();
    let a = build_agent(&harness, &store, "node-a", args.prevail);
    let b = build_agent(&harness, &store, "node-b", false);
    a.open().context("opening node-a")?;
    b.open().context("opening node-b")?;

    let b_instance = b.instance_id().context("node-b has no instance")?;
    let a_instance = a.instance_id().context("node-a has no instance")?;
    try_join(
        a.establish(
            EstablishRequest::new("node-b", "node-b:9000", b_instance)
                .with_fault_domain(args.fault_domain_b.clone())
                .with_duration_type(duration_type),
            Duration::from_secs(5),
        ),
        b.establish(
            EstablishRequest::new("node-a", "node-a:9000", a_instance)
                .with_fault_domain(args.fault_domain_a.clone())
                .with_duration_type(duration_type),
            Duration::from_secs(5),
        ),
    )
    .await
    .context("establishing leases between node-a and node-b")?;
    println!("leases established ({duration_type:?})");

    let monitor = LeaseMonitor::indirect(Arc::new(LoopbackIpc::serve(LeaseQueryService::new(a.clone()))), Arc::clone(&store));
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("node-a lease expired (indirect monitor): {}", monitor.is_lease_expired());

    harness.trigger_arbitration("node-a", "node-b")?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("node-a partner state after arbitration: {:?}", a.partner_state("node-b"));
    for (app, completion) in harness.arbitration_completions() {
        println!(
            "{app} arbitration verdict: local {} remote {}",
            completion.local_ttl, completion.remote_ttl
        );
    }

    print!("{}", harness.dump());

    monitor.close();
    a.close();
    b.close();
    Ok(())
}
