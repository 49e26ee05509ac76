use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the TCP front binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Per-connection output-buffer level that triggers backpressure
    /// reporting.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Set TCP_NODELAY on accepted connections.
    #[serde(default)]
    pub no_delay: bool,

    /// Largest accepted frame payload, in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: u32,
}

fn default_listen() -> String {
    "127.0.0.1:7100".to_string()
}

fn default_high_water_mark() -> usize {
    64 * 1024
}

fn default_max_payload() -> u32 {
    edge_router::frame::DEFAULT_MAX_PAYLOAD
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            high_water_mark: default_high_water_mark(),
            no_delay: false,
            max_payload: default_max_payload(),
        }
    }
}
