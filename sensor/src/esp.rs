use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht22;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, Gpio34, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use station_common::{
    config::{CONFIG_LEN, DEFAULT_INTERVAL_SECONDS},
    provisioning::{
        apply_config_update, build_config_view, validate_config_update, validate_wifi_update,
        PORTAL_RETRY_SLEEP, PORTAL_TIMEOUT,
    },
    run_cycle, ConfigRegion, ConfigStore, ConfigUpdate, ConfigView, CycleReport, Endpoint,
    Sample, Sensor, SensorError, StationConfig, StorageError, SupplyMonitor, TcpNetwork,
};

const NVS_NAMESPACE: &str = "station";
const NVS_CONFIG_KEY: &str = "config";
const NVS_WIFI_KEY: &str = "wifi_json";

const DHT22_PIN: i32 = 13;
/// Supply is measured through a 1:2 resistor divider on GPIO34.
const SUPPLY_DIVIDER_RATIO: f32 = 2.0;

const PROVISIONING_AP_SSID: &str = "WeatherStation-AP";
const PROVISIONING_AP_PASSWORD: &str = "WeatherSetup";
const MAX_HTTP_BODY: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

const STATION_PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Weather Station Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Weather Station Setup</h1>
  <p class="muted">The station restarts and starts uploading once saved.</p>

  <div class="card">
    <h2>WiFi</h2>
    <label>SSID</label><input id="wifiSsid" type="text">
    <label>Password (leave blank to keep current)</label><input id="wifiPass" type="password">
  </div>

  <div class="card">
    <h2>ThingSpeak</h2>
    <label>Write API key (leave blank to keep current)</label><input id="apiKey" type="text" maxlength="16">
    <label>Update interval (seconds)</label><input id="updateInterval" type="number" min="1">
    <p class="muted">API key set: <span id="apiKeySet">--</span></p>
  </div>

  <button id="save">Save and restart</button>
  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    async function load(){
      const c=await api('/api/config');
      q('wifiSsid').value=c.wifiSsid||'';
      q('updateInterval').value=c.updateInterval||120;
      q('apiKeySet').textContent=String(!!c.apiKeySet);
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={
          wifiSsid:q('wifiSsid').value.trim(),
          wifiPass:q('wifiPass').value||undefined,
          apiKey:q('apiKey').value.trim()||undefined,
          updateInterval:Number(q('updateInterval').value||120),
        };
        await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. Restarting...';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WifiCredentials {
    ssid: String,
    pass: String,
}

#[derive(Debug, Deserialize)]
struct PortalSubmission {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(flatten)]
    config: ConfigUpdate,
}

#[derive(Debug, Serialize)]
struct PortalView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(flatten)]
    config: ConfigView,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// The 20 byte station config stored as one raw NVS blob.
struct NvsRegion {
    nvs: EspNvs<NvsDefault>,
    pending: Option<[u8; CONFIG_LEN]>,
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

struct AdcSupply {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl ConfigRegion for NvsRegion {
    fn read(&mut self, buf: &mut [u8; CONFIG_LEN]) -> Result<(), StorageError> {
        let mut raw = [0_u8; CONFIG_LEN];
        let stored = self
            .nvs
            .get_raw(NVS_CONFIG_KEY, &mut raw)
            .map_err(|err| StorageError::Read(format!("{err:?}")))?;

        *buf = [0_u8; CONFIG_LEN];
        if let Some(bytes) = stored {
            let len = bytes.len().min(CONFIG_LEN);
            buf[..len].copy_from_slice(&bytes[..len]);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8; CONFIG_LEN]) -> Result<(), StorageError> {
        self.pending = Some(*bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let Some(bytes) = self.pending.take() else {
            return Ok(());
        };
        // set_raw commits the NVS handle before returning.
        self.nvs
            .set_raw(NVS_CONFIG_KEY, &bytes)
            .map_err(|err| StorageError::Commit(format!("{err:?}")))?;
        Ok(())
    }
}

impl NvsStore {
    fn open_config_region(&self) -> anyhow::Result<NvsRegion> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        Ok(NvsRegion { nvs, pending: None })
    }

    fn load_station_config(&self) -> anyhow::Result<StationConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut store = ConfigStore::open(self.open_config_region()?);
        Ok(store.load())
    }

    fn update_station_config(&self, update: &ConfigUpdate) -> anyhow::Result<StationConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut store = ConfigStore::open(self.open_config_region()?);
        let next = apply_config_update(&store.load(), update);
        store
            .save_if_changed(&next)
            .context("failed to persist station config")?;
        Ok(next)
    }

    fn load_wifi_credentials(&self) -> anyhow::Result<WifiCredentials> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 256];

        match nvs.get_str(NVS_WIFI_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<WifiCredentials>(value)?),
            None => Ok(WifiCredentials::default()),
        }
    }

    fn save_wifi_credentials(&self, credentials: &WifiCredentials) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(credentials)?;
        nvs.set_str(NVS_WIFI_KEY, &payload)?;
        Ok(())
    }
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl Sensor for Dht22Sensor {
    fn sample(&mut self) -> Result<Sample, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => Ok(Sample {
                temperature_c: reading.temperature,
                humidity: reading.relative_humidity,
            }),
            Err(err) => Err(SensorError::Bus(format!(
                "DHT22 on GPIO{DHT22_PIN}: {err:?}"
            ))),
        }
    }
}

impl AdcSupply {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let driver = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(driver, pin, &config)?;
        Ok(Self { channel })
    }
}

impl SupplyMonitor for AdcSupply {
    fn supply_volts(&mut self) -> f32 {
        match self.channel.read() {
            Ok(millivolts) => f32::from(millivolts) * SUPPLY_DIVIDER_RATIO / 1000.0,
            Err(err) => {
                warn!("failed to read supply voltage: {err:?}");
                0.0
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sleep_for = match wake_cycle() {
        Ok(duration) => duration,
        Err(err) => {
            warn!("wake cycle aborted: {err:#}");
            Duration::from_secs(u64::from(DEFAULT_INTERVAL_SECONDS))
        }
    };

    deep_sleep(sleep_for)
}

fn wake_cycle() -> anyhow::Result<Duration> {
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = nvs_store
        .load_station_config()
        .context("failed to open station config")?;
    let wifi_credentials = nvs_store.load_wifi_credentials().unwrap_or_else(|err| {
        warn!("failed to load wifi credentials from NVS: {err:#}");
        WifiCredentials::default()
    });

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let wifi = match connect_wifi(
        modem,
        sys_loop,
        nvs_partition,
        &wifi_credentials,
        config.is_provisioned(),
    )
    .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("connected to `{}`", wifi_credentials.ssid);
            wifi
        }
        WifiStartup::Provisioning(wifi) => return run_portal(wifi, nvs_store),
    };

    let mut sensor =
        Dht22Sensor::new(pins.gpio13.downgrade()).context("failed to initialize DHT22")?;
    let mut supply = AdcSupply::new(adc1, pins.gpio34)
        .map_err(|err| warn!("supply monitor unavailable, reporting 0V: {err:#}"))
        .ok();
    let mut network = TcpNetwork::new(is_wifi_station_connected, UPLOAD_TIMEOUT);

    match run_cycle(
        &config,
        &mut sensor,
        &mut supply,
        &mut network,
        &Endpoint::thingspeak(),
    ) {
        CycleReport::Uploaded(_) => info!("result: ok"),
        CycleReport::UploadFailed(_, err) => warn!("result: failed ({err})"),
        CycleReport::SensorFailed(_) => {}
    }

    drop(wifi);
    Ok(config.sleep_duration())
}

/// Serves the setup portal until a submission arrives (then restarts) or the
/// portal times out (then returns the retry sleep).
fn run_portal(wifi: EspWifi<'static>, nvs_store: NvsStore) -> anyhow::Result<Duration> {
    warn!(
        "starting provisioning AP `{}` for {}s",
        PROVISIONING_AP_SSID,
        PORTAL_TIMEOUT.as_secs()
    );

    let submitted = Arc::new(AtomicBool::new(false));
    let server = create_provisioning_http_server(nvs_store, submitted.clone())?;
    let started = Instant::now();

    while started.elapsed() < PORTAL_TIMEOUT {
        if submitted.load(Ordering::Acquire) {
            info!("configuration saved; restarting");
            thread::sleep(Duration::from_millis(500));
            drop(server);
            drop(wifi);
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        thread::sleep(Duration::from_secs(1));
    }

    warn!("failed to connect and hit timeout");
    drop(server);
    drop(wifi);
    Ok(PORTAL_RETRY_SLEEP)
}

fn create_provisioning_http_server(
    nvs_store: NvsStore,
    submitted: Arc<AtomicBool>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(STATION_PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let config = nvs_store.load_station_config().unwrap_or_default();
            let wifi = nvs_store.load_wifi_credentials().unwrap_or_default();
            let payload = PortalView {
                wifi_ssid: wifi.ssid,
                wifi_pass_set: !wifi.pass.is_empty(),
                config: build_config_view(&config),
            };
            write_json(req, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let submission: PortalSubmission =
            serde_json::from_slice(&body).context("invalid config payload")?;

        if let Err(message) =
            validate_wifi_update(&submission.wifi_ssid, submission.wifi_pass.as_deref())
        {
            return write_error(req, 400, message);
        }
        if let Err(message) = validate_config_update(&submission.config) {
            return write_error(req, 400, message);
        }
        if submission.config.api_key.is_none()
            && !nvs_store.load_station_config()?.is_provisioned()
        {
            return write_error(req, 400, "apiKey is required");
        }

        let mut wifi = nvs_store.load_wifi_credentials().unwrap_or_default();
        wifi.ssid = submission.wifi_ssid.trim().to_string();
        if let Some(pass) = submission.wifi_pass {
            wifi.pass = pass;
        }
        nvs_store.save_wifi_credentials(&wifi)?;
        let config = nvs_store.update_station_config(&submission.config)?;

        submitted.store(true, Ordering::Release);
        let payload = PortalView {
            wifi_ssid: wifi.ssid,
            wifi_pass_set: !wifi.pass.is_empty(),
            config: build_config_view(&config),
        };
        write_json(req, &payload)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: &WifiCredentials,
    provisioned: bool,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if credentials.ssid.trim().is_empty() || !provisioned {
        warn!("station not provisioned; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let Some(client) = client_configuration(credentials) else {
        warn!("stored wifi credentials do not fit the driver; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    };
    wifi.set_configuration(&Configuration::Client(client))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credentials.ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn client_configuration(credentials: &WifiCredentials) -> Option<ClientConfiguration> {
    let auth_method = if credentials.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Some(ClientConfiguration {
        ssid: credentials.ssid.as_str().try_into().ok()?,
        password: credentials.pass.as_str().try_into().ok()?,
        auth_method,
        ..Default::default()
    })
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// Powers down until the RTC timer fires. Waking is a full reset.
fn deep_sleep(duration: Duration) -> ! {
    info!("going to deep sleep for {}s", duration.as_secs());
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    unsafe { esp_idf_svc::sys::esp_deep_sleep(micros) }
}
