use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchRules;
use crate::window::DEFAULT_WINDOW;

/// Serializable coalescer settings, for embedding in an application's own
/// configuration file. Missing fields take their defaults:
///
/// ```
/// use batch_coalescer::CoalescerConfig;
///
/// let config: CoalescerConfig = serde_json::from_str(r#"{"window_ms": 25}"#).unwrap();
///
/// assert_eq!(config.max_size.get(), 100);
/// assert_eq!(config.window().as_millis(), 25);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    pub max_size: NonZeroUsize,
    pub window_ms: u64,
}

impl CoalescerConfig {
    pub const DEFAULT_MAX_SIZE: usize = 100;

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn into_rules<Handler>(self, handler: Handler) -> BatchRules<Handler, Duration> {
        BatchRules {
            handler,
            window: self.window(),
            max_size: self.max_size,
        }
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_size: NonZeroUsize::new(Self::DEFAULT_MAX_SIZE).unwrap_or(NonZeroUsize::MIN),
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
        }
    }
}
