use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_MAX_PROMPT_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Delay between two status fetches of the same job.
    pub poll_interval: Duration,
    pub page_size: u32,
    pub max_prompt_len: usize,
    /// Start pollers for in-progress jobs brought in by a history load.
    pub resume_polling_on_load: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            max_prompt_len: DEFAULT_MAX_PROMPT_LEN,
            resume_polling_on_load: true,
        }
    }
}
