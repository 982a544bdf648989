//! One wake cycle: measure, upload, report. The caller sleeps afterwards no
//! matter what happened here.

use log::{info, warn};
use thiserror::Error;

use crate::config::StationConfig;
use crate::endpoint::Endpoint;
use crate::heat_index::heat_index_celsius;
use crate::types::{Reading, Sample};
use crate::uplink::{upload, Network, UploadError};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor returned an invalid reading")]
    InvalidReading,
    #[error("sensor bus error: {0}")]
    Bus(String),
}

pub trait Sensor {
    fn sample(&mut self) -> Result<Sample, SensorError>;
}

pub trait SupplyMonitor {
    fn supply_volts(&mut self) -> f32;
}

/// A monitor that failed to come up reports 0V.
impl<T: SupplyMonitor> SupplyMonitor for Option<T> {
    fn supply_volts(&mut self) -> f32 {
        self.as_mut().map_or(0.0, SupplyMonitor::supply_volts)
    }
}

#[derive(Debug)]
pub enum CycleReport {
    Uploaded(Reading),
    UploadFailed(Reading, UploadError),
    SensorFailed(SensorError),
}

impl CycleReport {
    pub fn uploaded(&self) -> bool {
        matches!(self, Self::Uploaded(_))
    }

    pub fn reading(&self) -> Option<&Reading> {
        match self {
            Self::Uploaded(reading) | Self::UploadFailed(reading, _) => Some(reading),
            Self::SensorFailed(_) => None,
        }
    }
}

pub fn take_reading<S: Sensor, V: SupplyMonitor>(
    sensor: &mut S,
    supply: &mut V,
) -> Result<Reading, SensorError> {
    let sample = sensor.sample()?;
    if !sample.is_valid() {
        return Err(SensorError::InvalidReading);
    }

    Ok(Reading {
        temperature_c: sample.temperature_c,
        humidity: sample.humidity,
        heat_index_c: heat_index_celsius(sample.temperature_c, sample.humidity),
        supply_volts: supply.supply_volts(),
    })
}

pub fn run_cycle<S, V, N>(
    config: &StationConfig,
    sensor: &mut S,
    supply: &mut V,
    network: &mut N,
    endpoint: &Endpoint,
) -> CycleReport
where
    S: Sensor,
    V: SupplyMonitor,
    N: Network,
{
    let reading = match take_reading(sensor, supply) {
        Ok(reading) => reading,
        Err(err) => {
            warn!("failed to read from DHT sensor: {err}");
            return CycleReport::SensorFailed(err);
        }
    };

    info!(
        "humidity: {:.2}% temperature: {:.2}°C heat index: {:.2}°C supply: {:.2}V",
        reading.humidity, reading.temperature_c, reading.heat_index_c, reading.supply_volts
    );

    match upload(network, endpoint, &config.credential, &reading) {
        Ok(()) => CycleReport::Uploaded(reading),
        Err(err) => {
            warn!("can not send data: {err}");
            CycleReport::UploadFailed(reading, err)
        }
    }
}
