use std::path::PathBuf;

use config::Config;
use serde::Deserialize;

mod flow;
pub use flow::FlowConfig;

mod logger;
pub use logger::LoggerConfig;

mod router;
pub use router::{ChannelConfig, RouterConfig};

mod server;
pub use server::ServerConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use edge_router::ChannelKind;

    fn parse(toml: &str) -> NodeConfig {
        Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.server.listen, "127.0.0.1:7100");
        assert_eq!(config.flow.queue_capacity, 1000);
        assert!(config.router.channels.is_empty());
        assert!(config.router.routes.is_empty());
        assert_eq!(config.logger.level, tracing::Level::INFO);
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            no_delay = true

            [flow]
            queue_capacity = 64

            [logger]
            level = "debug"

            [[router.channels]]
            name = "inference"
            kind = "publish-subscribe"

            [router.routes]
            prompts = ["inference"]
            "#,
        );

        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert!(config.server.no_delay);
        assert_eq!(config.flow.queue_capacity, 64);
        assert_eq!(config.logger.level, tracing::Level::DEBUG);
        assert_eq!(config.router.channels.len(), 1);
        assert_eq!(config.router.channels[0].name, "inference");
        assert_eq!(
            config.router.channels[0].kind,
            ChannelKind::PublishSubscribe
        );
        assert_eq!(
            config.router.routes.get("prompts"),
            Some(&vec!["inference".to_string()])
        );
    }
}
