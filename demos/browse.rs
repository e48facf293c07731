//! Browses for one service type and prints services as they come and go.
//!
//! Usage: `cargo run --example browse -- _rimres._tcp [domain ...]`

use std::env;
use std::sync::Arc;

use log::{info, warn};
use service_discovery::{
    AdapterImplementation, DiscoveryConfig, LocalService, PropertyPattern, ServiceDiscovery,
    ServiceEventKind, create_adapter,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let Some(service_type) = args.next() else {
        eprintln!("usage: browse <service-type> [domain ...]");
        return Ok(());
    };
    let mut domains: Vec<String> = args.collect();
    if domains.is_empty() {
        domains.push("local".to_string());
    }

    let config = DiscoveryConfig {
        service_types: vec![service_type.clone()],
        domains,
        ..DiscoveryConfig::default()
    };
    let adapter = create_adapter(AdapterImplementation::Mdns, &config)?;

    let discovery = ServiceDiscovery::new(Arc::clone(&adapter));
    discovery.added_component_connect(|event| {
        let service = event.configuration();
        info!(" + ADDED SERVICE: {} ({:?})", service.name(), service.properties());
    });
    discovery.removed_component_connect(|event| {
        warn!(" - REMOVED SERVICE: {}", event.name());
    });
    let mut stream = discovery.subscribe();
    discovery.add_service_type(service_type.as_str())?;
    discovery.listen_on(config.domains.iter().cloned())?;

    // Publish a sample service so there is something to see.
    let mut sample = LocalService::new(
        Arc::clone(&adapter),
        "BrowseDemo",
        service_type.as_str(),
        10000,
        ["service_year=1999"],
    )?;
    sample.publish()?;

    tokio::spawn(async move {
        while let Ok(event) = stream.recv().await {
            if event.kind() == ServiceEventKind::Added {
                info!("stream: {} joined", event.name());
            }
        }
    });

    info!("Browsing for {}, press Ctrl-C to exit", service_type);
    tokio::signal::ctrl_c().await?;

    let everything = PropertyPattern::default();
    for service in discovery.find_services(&everything) {
        info!("     SERVICE: {} {} {}", service.name(), service.service_type(), service.interface());
    }

    sample.unpublish()?;
    discovery.stop()?;
    Ok(())
}
