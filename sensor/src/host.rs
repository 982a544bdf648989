use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tracing::{info, warn};

use station_common::{
    config::CONFIG_LEN,
    provisioning::{apply_config_update, validate_config_update, PORTAL_RETRY_SLEEP},
    run_cycle, ConfigRegion, ConfigStore, ConfigUpdate, CycleReport, Endpoint, Sample, Sensor,
    SensorError, StationConfig, StorageError, SupplyMonitor, TcpNetwork,
};

const DEFAULT_STATE_PATH: &str = "station-config.bin";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state_path = std::env::var("STATION_STATE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_PATH));
    let endpoint = endpoint_from_env();

    info!(
        "station simulator started (state: {}, endpoint: {}:{}{})",
        state_path.display(),
        endpoint.host,
        endpoint.port,
        endpoint.path
    );

    let mut tick: u64 = 0;

    loop {
        tick = tick.saturating_add(1);

        // Each cycle starts from scratch, like a reset-on-wake.
        let path = state_path.clone();
        let cycle_endpoint = endpoint.clone();
        let sleep = tokio::task::spawn_blocking(move || wake_cycle(&path, &cycle_endpoint, tick))
            .await
            .context("wake cycle task failed")?;

        info!("going to sleep for {}s", sleep.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

fn endpoint_from_env() -> Endpoint {
    let mut endpoint = Endpoint::thingspeak();
    if let Ok(host) = std::env::var("STATION_HOST") {
        endpoint.host = host;
    }
    if let Some(port) = std::env::var("STATION_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        endpoint.port = port;
    }
    endpoint
}

fn wake_cycle(state_path: &Path, endpoint: &Endpoint, tick: u64) -> Duration {
    let mut store = ConfigStore::open(FileRegion::new(state_path));
    let mut config = store.load();

    if !config.is_provisioned() {
        match portal_submission_from_env(&config) {
            Some(next) => {
                if let Err(err) = store.save(&next) {
                    warn!("failed to persist provisioned config: {err}");
                }
                config = next;
            }
            None => {
                warn!("no apiKey provisioned; set STATION_API_KEY to simulate the portal");
                return PORTAL_RETRY_SLEEP;
            }
        }
    }
    drop(store);

    let mut sensor = SimulatedSensor { tick };
    let mut supply = SimulatedSupply;
    let mut network = TcpNetwork::new(|| true, UPLOAD_TIMEOUT);

    match run_cycle(&config, &mut sensor, &mut supply, &mut network, endpoint) {
        CycleReport::Uploaded(_) => info!("cycle {tick}: upload ok"),
        CycleReport::UploadFailed(_, err) => warn!("cycle {tick}: upload failed: {err}"),
        CycleReport::SensorFailed(err) => warn!("cycle {tick}: no reading: {err}"),
    }

    config.sleep_duration()
}

/// Stand-in for the captive portal: reads the form fields from the
/// environment.
fn portal_submission_from_env(current: &StationConfig) -> Option<StationConfig> {
    let api_key = std::env::var("STATION_API_KEY").ok()?;
    let update = ConfigUpdate {
        api_key: Some(api_key),
        update_interval: std::env::var("STATION_INTERVAL")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(station_common::config::DEFAULT_INTERVAL_SECONDS),
    };

    if let Err(message) = validate_config_update(&update) {
        warn!("rejected simulated portal submission: {message}");
        return None;
    }

    info!("provisioned from environment");
    Some(apply_config_update(current, &update))
}

/// Configuration region stored in a plain file. A missing file reads as
/// all zeroes.
struct FileRegion {
    path: PathBuf,
    pending: Option<[u8; CONFIG_LEN]>,
}

impl FileRegion {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            pending: None,
        }
    }
}

impl ConfigRegion for FileRegion {
    fn read(&mut self, buf: &mut [u8; CONFIG_LEN]) -> Result<(), StorageError> {
        *buf = [0_u8; CONFIG_LEN];
        match fs::read(&self.path) {
            Ok(bytes) => {
                let len = bytes.len().min(CONFIG_LEN);
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Read(err.to_string())),
        }
    }

    fn write(&mut self, bytes: &[u8; CONFIG_LEN]) -> Result<(), StorageError> {
        self.pending = Some(*bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let Some(bytes) = self.pending.take() else {
            return Ok(());
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|err| StorageError::Write(err.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::Commit(err.to_string()))
    }
}

struct SimulatedSensor {
    tick: u64,
}

impl Sensor for SimulatedSensor {
    fn sample(&mut self) -> Result<Sample, SensorError> {
        Ok(Sample {
            temperature_c: 20.0 + ((self.tick % 8) as f32 * 0.2),
            humidity: 42.0 + ((self.tick % 6) as f32 * 0.5),
        })
    }
}

struct SimulatedSupply;

impl SupplyMonitor for SimulatedSupply {
    fn supply_volts(&mut self) -> f32 {
        3.3
    }
}
