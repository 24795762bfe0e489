use crate::idle::IdleConfig;

/// EngineConfig sizes the scopes of an Engine and their shared resources.
#[derive(Debug, Clone, clap::Args, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Number of single-threaded scopes (workers) of the engine.
    #[arg(long, default_value = "1", env = "BRIDGE_SCOPES")]
    pub scopes: usize,
    /// Number of buffer slots available to each scope for queued messages.
    #[arg(long, default_value = "64", env = "BRIDGE_BUFFER_SLOTS")]
    pub buffer_slots: usize,
    /// Capacity in bytes of each buffer slot.
    #[arg(long, default_value = "65536", env = "BRIDGE_BUFFER_SLOT_CAPACITY")]
    pub buffer_slot_capacity: usize,
    /// Number of budgets which may be held at once, across all scopes.
    #[arg(long, default_value = "1024", env = "BRIDGE_BUDGET_SLOTS")]
    pub budget_slots: usize,

    #[command(flatten)]
    #[serde(flatten)]
    pub idle: IdleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scopes: 1,
            buffer_slots: 64,
            buffer_slot_capacity: 65536,
            budget_slots: 1024,
            idle: IdleConfig::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        engine: EngineConfig,
    }

    #[test]
    fn test_config_from_args_and_json() {
        let cli = Cli::parse_from([
            "bridge",
            "--scopes",
            "4",
            "--idle-max-park",
            "250ms",
        ]);
        assert_eq!(cli.engine.scopes, 4);
        assert_eq!(cli.engine.buffer_slots, 64);
        assert_eq!(
            cli.engine.idle.idle_max_park,
            std::time::Duration::from_millis(250)
        );

        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "scopes": 2,
            "bufferSlots": 8,
            "bufferSlotCapacity": 1024,
            "budgetSlots": 16,
            "idleSpins": 0,
            "idleYields": 0,
            "idleMinPark": "1ms",
            "idleMaxPark": "1s",
        }))
        .unwrap();
        assert_eq!(config.buffer_slot_capacity, 1024);
        assert_eq!(config.idle.idle_min_park, std::time::Duration::from_millis(1));
    }
}
