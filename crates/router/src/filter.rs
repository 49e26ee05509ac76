//! Composable message predicates.
//!
//! A channel delivers a message only if every filter in its chain
//! accepts it.

use crate::message::ChannelMessage;

pub trait MessageFilter: Send + Sync {
    fn accept(&self, message: &ChannelMessage) -> bool;

    fn name(&self) -> &str;
}

/// Accepts messages whose topic matches a pattern.
///
/// Patterns are matched exactly, except that `*` matches any run of
/// characters and `?` matches exactly one.
pub struct TopicFilter {
    pattern: String,
}

impl TopicFilter {
    pub fn new(pattern: impl Into<String>) -> Self {
        TopicFilter {
            pattern: pattern.into(),
        }
    }
}

impl MessageFilter for TopicFilter {
    fn accept(&self, message: &ChannelMessage) -> bool {
        glob_match(&self.pattern, &message.topic)
    }

    fn name(&self) -> &str {
        "topic"
    }
}

/// Accepts messages from exactly one sender.
pub struct SenderFilter {
    sender: String,
}

impl SenderFilter {
    pub fn new(sender: impl Into<String>) -> Self {
        SenderFilter {
            sender: sender.into(),
        }
    }
}

impl MessageFilter for SenderFilter {
    fn accept(&self, message: &ChannelMessage) -> bool {
        message.sender == self.sender
    }

    fn name(&self) -> &str {
        "sender"
    }
}

/// Accepts messages at or above a priority floor.
pub struct MinPriorityFilter {
    min: u8,
}

impl MinPriorityFilter {
    pub fn new(min: u8) -> Self {
        MinPriorityFilter { min }
    }
}

impl MessageFilter for MinPriorityFilter {
    fn accept(&self, message: &ChannelMessage) -> bool {
        message.priority >= self.min
    }

    fn name(&self) -> &str {
        "min-priority"
    }
}

/// A filter wrapping a closure.
pub struct ClosureFilter {
    name: String,
    f: Box<dyn Fn(&ChannelMessage) -> bool + Send + Sync>,
}

impl ClosureFilter {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&ChannelMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        ClosureFilter {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl MessageFilter for ClosureFilter {
    fn accept(&self, message: &ChannelMessage) -> bool {
        (self.f)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Glob match with `*` (any run) and `?` (one character), over bytes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Backtrack: let the last star swallow one more byte.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
