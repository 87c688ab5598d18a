use std::path::Path;

use anyhow::Context;
use steward_config::load_config_from;
use steward_config::shared::NodeConfig;

/// Loads and validates the node configuration found in `directory`.
pub fn load_node_config(directory: &Path) -> anyhow::Result<NodeConfig> {
    let config = load_config_from::<NodeConfig>(directory)
        .with_context(|| format!("failed to load configuration from {}", directory.display()))?;
    config.validate().context("invalid node configuration")?;

    Ok(config)
}
