use std::time::Duration;

/// IdleConfig tunes the back-off of a scope which has no work to do.
#[derive(Debug, Clone, clap::Args, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleConfig {
    /// Number of busy polls before yielding to the runtime.
    #[arg(long, default_value = "64", env = "BRIDGE_IDLE_SPINS")]
    pub idle_spins: u32,
    /// Number of yields to the runtime before parking.
    #[arg(long, default_value = "16", env = "BRIDGE_IDLE_YIELDS")]
    pub idle_yields: u32,
    /// Initial delay of a parked scope.
    #[arg(long, default_value = "1us", value_parser = humantime::parse_duration, env = "BRIDGE_IDLE_MIN_PARK")]
    #[serde(with = "humantime_serde")]
    pub idle_min_park: Duration,
    /// Maximum delay of a parked scope, reached by doubling.
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration, env = "BRIDGE_IDLE_MAX_PARK")]
    #[serde(with = "humantime_serde")]
    pub idle_max_park: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_spins: 64,
            idle_yields: 16,
            idle_min_park: Duration::from_micros(1),
            idle_max_park: Duration::from_millis(100),
        }
    }
}

/// IdleStrategy backs off a scope's run loop: it spins, then yields to the
/// runtime, then parks with a doubling delay up to a maximum.
/// Finding work resets it.
#[derive(Debug)]
pub struct IdleStrategy {
    config: IdleConfig,
    idles: u32,
    park: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Spin,
    Yield,
    Park(Duration),
}

impl IdleStrategy {
    pub fn new(config: IdleConfig) -> Self {
        let park = config.idle_min_park;
        Self {
            config,
            idles: 0,
            park,
        }
    }

    pub fn reset(&mut self) {
        self.idles = 0;
        self.park = self.config.idle_min_park;
    }

    /// Next back-off step, advancing the strategy.
    pub fn next_backoff(&mut self) -> Backoff {
        let IdleConfig {
            idle_spins,
            idle_yields,
            idle_max_park,
            ..
        } = self.config;

        self.idles = self.idles.saturating_add(1);

        if self.idles <= idle_spins {
            Backoff::Spin
        } else if self.idles <= idle_spins.saturating_add(idle_yields) {
            Backoff::Yield
        } else {
            let park = self.park;
            self.park = (self.park * 2).min(idle_max_park);
            Backoff::Park(park.min(idle_max_park))
        }
    }

    /// Idle for one back-off step, parking no longer than `limit`.
    pub async fn idle(&mut self, limit: Option<Duration>) {
        match self.next_backoff() {
            Backoff::Spin => std::hint::spin_loop(),
            Backoff::Yield => tokio::task::yield_now().await,
            Backoff::Park(park) => {
                let park = limit.map(|limit| park.min(limit)).unwrap_or(park);
                tokio::time::sleep(park).await
            }
        }
    }
}
