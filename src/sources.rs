use anyhow::Result;

use crate::config::Config;
use crate::registry::ConnectorRegistry;

/// `shx sources`: configured sources, their connectors, and schedules.
pub fn list_sources(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured. Add a [sources.<source_type>] section.");
        return Ok(());
    }
    let registry = ConnectorRegistry::from_config(config)?;

    println!("{:<16} {:<12} {:<16} CONNECTOR", "SOURCE", "TYPE", "SCHEDULE");
    for (source_type, connector) in registry.iter() {
        let source = config.source(source_type)?;
        println!(
            "{:<16} {:<12} {:<16} {}",
            source_type.as_str(),
            source.connector,
            source.schedule,
            connector.describe()
        );
    }
    Ok(())
}
