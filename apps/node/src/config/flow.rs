use serde::Deserialize;

/// Default size of the bounded event queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Deserialize, Clone)]
pub struct FlowConfig {
    /// Events the bounded queue holds before publishes are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}
