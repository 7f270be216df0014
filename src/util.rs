use std::time::Duration;

const CONFIG_PATH: &str = "TITAN_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./titan.json";

pub fn get_default_config_path() -> String {
    let path_from_env = std::env::var(CONFIG_PATH);
    path_from_env.unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

const POOL_SWEEP_SECS: &str = "TITAN_POOL_SWEEP_SECS";

const DEFAULT_POOL_SWEEP: u64 = 30;

pub fn get_pool_sweep_interval() -> Duration {
    let secs = std::env::var(POOL_SWEEP_SECS)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_POOL_SWEEP);
    Duration::from_secs(secs)
}

const SNAPSHOT_REFRESH_SECS: &str = "TITAN_SNAPSHOT_REFRESH_SECS";

const DEFAULT_SNAPSHOT_REFRESH: u64 = 5;

pub fn get_snapshot_refresh_interval() -> Duration {
    let secs = std::env::var(SNAPSHOT_REFRESH_SECS)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SNAPSHOT_REFRESH);
    Duration::from_secs(secs)
}
