/// Raw values reported by the temperature/humidity sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature_c: f32,
    pub humidity: f32,
}

impl Sample {
    pub fn is_valid(&self) -> bool {
        !self.temperature_c.is_nan() && !self.humidity.is_nan()
    }
}

/// One complete measurement as uploaded each wake cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity: f32,
    pub heat_index_c: f32,
    pub supply_volts: f32,
}
