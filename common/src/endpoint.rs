pub const THINGSPEAK_HOST: &str = "api.thingspeak.com";
pub const THINGSPEAK_PORT: u16 = 80;
pub const THINGSPEAK_UPDATE_PATH: &str = "/update.json";

pub const API_KEY_HEADER: &str = "X-THINGSPEAKAPIKEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn thingspeak() -> Self {
        Self {
            host: THINGSPEAK_HOST.to_string(),
            port: THINGSPEAK_PORT,
            path: THINGSPEAK_UPDATE_PATH.to_string(),
        }
    }
}
