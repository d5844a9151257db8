use std::{
    collections::BTreeMap, fmt::Display, fs, io, net::SocketAddr, str::FromStr, time::Duration,
};

use anyhow::{bail, Context};
use fleet_backend::BackendConfig;
use fleet_core::{FleetOptions, FleetProfile, SensorTolerances};
use serde::Deserialize;
use shared::domain::{Direction, RoverId, TaskName};
use url::Url;

const SETTINGS_FILE: &str = "gateway.toml";
/// Fan-out bodies carry failures under this key next to the rover entries.
const ERRORS_KEY: &str = "errors";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub backend_url: String,
    pub request_timeout_ms: u64,
    pub read_attempts: u32,
    pub retry_backoff_ms: u64,
    pub fan_out_timeout_ms: u64,
    pub session_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub battery_reserve: u8,
    pub move_battery_cost: u8,
    pub task_battery_costs: BTreeMap<String, u8>,
    pub task_crews: BTreeMap<String, usize>,
    pub sensor_tolerances: SensorTolerances,
    pub rovers: Vec<String>,
    pub directions: Vec<String>,
    pub tasks: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let profile = FleetProfile::default();
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            backend_url: BackendConfig::default().base_url,
            request_timeout_ms: 5_000,
            read_attempts: 2,
            retry_backoff_ms: 200,
            fan_out_timeout_ms: 8_000,
            session_idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            battery_reserve: profile.battery_reserve,
            move_battery_cost: profile.move_battery_cost,
            task_battery_costs: keyed(&profile.task_battery_costs),
            task_crews: keyed(&profile.task_crews),
            sensor_tolerances: profile.sensor_tolerances,
            rovers: names(&profile.rovers),
            directions: names(&profile.directions),
            tasks: names(&profile.tasks),
        }
    }
}

impl Settings {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.backend_url.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            read_attempts: self.read_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn fleet_profile(&self) -> FleetProfile {
        FleetProfile {
            rovers: self.rovers.iter().map(RoverId::new).collect(),
            directions: self.directions.iter().map(Direction::new).collect(),
            tasks: self.tasks.iter().map(TaskName::new).collect(),
            battery_reserve: self.battery_reserve,
            move_battery_cost: self.move_battery_cost,
            task_battery_costs: self
                .task_battery_costs
                .iter()
                .map(|(task, cost)| (TaskName::new(task), *cost))
                .collect(),
            task_crews: self
                .task_crews
                .iter()
                .map(|(task, crew)| (TaskName::new(task), *crew))
                .collect(),
            sensor_tolerances: self.sensor_tolerances,
        }
    }

    pub fn fleet_options(&self) -> FleetOptions {
        FleetOptions {
            session_idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
            fan_out_timeout: Duration::from_millis(self.fan_out_timeout_ms),
            ..FleetOptions::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind_addr '{}'", self.bind_addr))?;
        validate_backend_url(&self.backend_url)?;
        if self.read_attempts == 0 {
            bail!("read_attempts must be at least 1");
        }
        for (field, value) in [
            ("battery_reserve", self.battery_reserve),
            ("move_battery_cost", self.move_battery_cost),
        ] {
            if value > 100 {
                bail!("{field} is a percentage, got {value}");
            }
        }
        for (task, cost) in &self.task_battery_costs {
            if *cost > 100 {
                bail!("task_battery_costs.{task} is a percentage, got {cost}");
            }
        }
        if let Some(rover) = self
            .rovers
            .iter()
            .find(|rover| rover.trim() == ERRORS_KEY)
        {
            bail!("rover name '{rover}' is reserved for the errors entry of fleet replies");
        }
        for (field, values) in [
            ("rovers", &self.rovers),
            ("directions", &self.directions),
            ("tasks", &self.tasks),
        ] {
            if values.iter().all(|value| value.trim().is_empty()) {
                bail!("{field} must name at least one entry");
            }
        }
        Ok(())
    }
}

pub fn validate_backend_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid backend_url '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("backend_url must be http or https, got '{}'", url.scheme());
    }
    if url.host_str().is_none() {
        bail!("backend_url '{raw}' has no host");
    }
    Ok(url)
}

/// Defaults, then `gateway.toml` in the working directory, then the environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let file = match fs::read_to_string(SETTINGS_FILE) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("failed to read {SETTINGS_FILE}")),
    };
    let settings = load_settings_from(file.as_deref(), |key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = match file {
        Some(raw) => {
            toml::from_str::<Settings>(raw).with_context(|| format!("failed to parse {SETTINGS_FILE}"))?
        }
        None => Settings::default(),
    };

    if let Some(v) = lookup(&env, &["GATEWAY_BIND", "APP__BIND_ADDR"]) {
        settings.bind_addr = v;
    }
    if let Some(v) = lookup(&env, &["FLEET_BACKEND_URL", "APP__BACKEND_URL"]) {
        settings.backend_url = v;
    }
    if let Some(v) = parsed(&env, "APP__REQUEST_TIMEOUT_MS")? {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = parsed(&env, "APP__READ_ATTEMPTS")? {
        settings.read_attempts = v;
    }
    if let Some(v) = parsed(&env, "APP__RETRY_BACKOFF_MS")? {
        settings.retry_backoff_ms = v;
    }
    if let Some(v) = parsed(&env, "APP__FAN_OUT_TIMEOUT_MS")? {
        settings.fan_out_timeout_ms = v;
    }
    if let Some(v) = parsed(&env, "APP__SESSION_IDLE_TIMEOUT_SECS")? {
        settings.session_idle_timeout_secs = v;
    }
    if let Some(v) = parsed(&env, "APP__SWEEP_INTERVAL_SECS")? {
        settings.sweep_interval_secs = v;
    }
    if let Some(v) = parsed(&env, "APP__BATTERY_RESERVE")? {
        settings.battery_reserve = v;
    }
    if let Some(v) = parsed(&env, "APP__MOVE_BATTERY_COST")? {
        settings.move_battery_cost = v;
    }
    if let Some(v) = env("APP__ROVERS") {
        settings.rovers = list(&v);
    }
    if let Some(v) = env("APP__DIRECTIONS") {
        settings.directions = list(&v);
    }
    if let Some(v) = env("APP__TASKS") {
        settings.tasks = list(&v);
    }

    Ok(settings)
}

/// Later keys win over earlier ones.
fn lookup(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|key| env(key)).last()
}

fn parsed<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = env(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("invalid {key} '{raw}': {err}"))
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn names<T: Display>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn keyed<K: Display, V: Copy>(map: &BTreeMap<K, V>) -> BTreeMap<String, V> {
    map.iter().map(|(key, value)| (key.to_string(), *value)).collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
