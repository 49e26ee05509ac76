use std::collections::HashMap;

use edge_router::ChannelKind;
use serde::Deserialize;

#[derive(Deserialize, Clone, Default)]
pub struct RouterConfig {
    /// Channels to create at startup.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Topic → channel names routing table.
    #[serde(default)]
    pub routes: HashMap<String, Vec<String>>,
}

#[derive(Deserialize, Clone)]
pub struct ChannelConfig {
    pub name: String,

    #[serde(default = "default_kind", deserialize_with = "deserialize_kind")]
    pub kind: ChannelKind,
}

fn default_kind() -> ChannelKind {
    ChannelKind::PublishSubscribe
}

fn deserialize_kind<'de, D>(deserializer: D) -> Result<ChannelKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    match s.as_str() {
        "point-to-point" => Ok(ChannelKind::PointToPoint),
        "publish-subscribe" => Ok(ChannelKind::PublishSubscribe),
        "request-response" => Ok(ChannelKind::RequestResponse),
        "broadcast" => Ok(ChannelKind::Broadcast),
        "multicast" => Ok(ChannelKind::Multicast),
        other => Err(serde::de::Error::custom(format!(
            "unknown channel kind `{other}`"
        ))),
    }
}
