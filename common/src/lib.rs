pub mod config;
pub mod cycle;
pub mod endpoint;
pub mod heat_index;
pub mod provisioning;
pub mod telemetry;
pub mod types;
pub mod uplink;

pub use config::{ConfigRegion, ConfigStore, MemoryRegion, StationConfig, StorageError};
pub use cycle::{run_cycle, take_reading, CycleReport, Sensor, SensorError, SupplyMonitor};
pub use endpoint::Endpoint;
pub use heat_index::heat_index_celsius;
pub use provisioning::{ConfigUpdate, ConfigView};
pub use types::{Reading, Sample};
pub use uplink::{upload, Network, TcpNetwork, UploadError};
