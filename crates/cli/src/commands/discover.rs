use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use nodelink::runtime::{DiscoveredService, Discovery, DiscoveryEvent};
use tracing::debug;

use crate::cli::DiscoverArgs;
use crate::config::NodeConfig;
use crate::error::Result;

pub async fn execute(args: DiscoverArgs, explicit: Option<&Path>) -> Result<()> {
	let (config, _) = NodeConfig::load(explicit)?;
	let service_type = args.service_type.unwrap_or(config.service.hub_service_type);

	let discovery = Discovery::new()?;
	let mut browser = discovery.discover(&service_type)?;
	let mut found: BTreeMap<String, DiscoveredService> = BTreeMap::new();

	let deadline = tokio::time::sleep(Duration::from_millis(args.timeout_ms));
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = &mut deadline => break,
			event = browser.next() => match event {
				Some(DiscoveryEvent::Found(service)) => {
					debug!(target = "nodelink.discovery", name = %service.name, "found");
					found.insert(service.name.clone(), service);
				}
				Some(DiscoveryEvent::Lost { name }) => {
					found.remove(&name);
				}
				None => break,
			},
		}
	}
	browser.stop();
	discovery.shutdown();

	if found.is_empty() {
		eprintln!("no services of type {service_type} found");
		return Ok(());
	}
	for service in found.values() {
		println!("{}", format_service(service));
	}
	Ok(())
}

fn format_service(service: &DiscoveredService) -> String {
	let endpoint = service.endpoint().map(|endpoint| endpoint.to_string()).unwrap_or_else(|| "-".to_string());
	let addresses: Vec<String> = service.addresses.iter().map(ToString::to_string).collect();
	format!("{}\t{}\t{}", service.name, endpoint, addresses.join(","))
}
