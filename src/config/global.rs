use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct BootServiceConfig {
    /// Enable this option if you want to see more log when running the boot services.
    #[serde(default = "Default::default")]
    pub verbose: bool,

    /// Upper bound, in seconds, for each one-shot boot stage. Removable media
    /// can be slow to settle.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

impl Default for BootServiceConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

fn default_stage_timeout() -> u64 {
    180
}
