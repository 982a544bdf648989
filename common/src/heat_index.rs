//! Heat index ("feels like" temperature) from temperature and relative
//! humidity, after the NWS formulation.
//!
//! <https://www.wpc.ncep.noaa.gov/html/heatindex_equation.shtml>

pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 1.8 + 32.0
}

pub fn fahrenheit_to_celsius(temp_f: f32) -> f32 {
    (temp_f - 32.0) / 1.8
}

/// Heat index in °F for a temperature in °F and humidity in percent.
pub fn heat_index_fahrenheit(temp_f: f32, humidity: f32) -> f32 {
    let simple = 0.5 * (temp_f + 61.0 + (temp_f - 68.0) * 1.2 + humidity * 0.094);
    if simple <= 79.0 {
        return simple;
    }

    let t = temp_f;
    let rh = humidity;
    let mut hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
        - 0.224_755_41 * t * rh
        - 0.006_837_83 * t * t
        - 0.054_817_17 * rh * rh
        + 0.001_228_74 * t * t * rh
        + 0.000_852_82 * t * rh * rh
        - 0.000_001_99 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
    } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
    }

    hi
}

pub fn heat_index_celsius(temp_c: f32, humidity: f32) -> f32 {
    fahrenheit_to_celsius(heat_index_fahrenheit(
        celsius_to_fahrenheit(temp_c),
        humidity,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 0.05,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn mild_conditions_use_simple_formula() {
        assert_close(heat_index_celsius(25.0, 50.0), 24.86);
        assert_close(heat_index_celsius(10.0, 50.0), 8.36);
    }

    #[test]
    fn hot_humid_conditions_use_regression() {
        // NWS table: 95 °F at 60 % reads 114 °F.
        assert_close(heat_index_fahrenheit(95.0, 60.0), 113.09);
        assert_close(heat_index_celsius(35.0, 60.0), 45.05);
    }

    #[test]
    fn dry_heat_adjustment() {
        assert_close(heat_index_celsius(40.0, 10.0), 36.71);
    }

    #[test]
    fn muggy_adjustment() {
        assert_close(heat_index_celsius(30.0, 90.0), 40.77);
    }
}
