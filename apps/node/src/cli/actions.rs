use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use super::{arguments, node::Node};
use crate::config::{LoggerConfig, NodeConfig};

pub fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = NodeConfig::from_path(args.config)?;
    init_logging(&config.logger);

    Node::new(config).run()
}

fn init_logging(config: &LoggerConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.targets)
        .init();
}
