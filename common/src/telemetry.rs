//! HTTP request encoding for the ThingSpeak update endpoint.

use crate::endpoint::{Endpoint, API_KEY_HEADER};
use crate::types::Reading;

impl Reading {
    /// URL-encoded form body: temperature, humidity, heat index, supply
    /// voltage as `field1`..`field4`.
    pub fn form_body(&self) -> String {
        format!(
            "field1={:.2}&field2={:.2}&field3={:.2}&field4={:.2}",
            self.temperature_c, self.humidity, self.heat_index_c, self.supply_volts
        )
    }
}

/// Characters outside printable ASCII are dropped from the credential.
pub fn build_request(endpoint: &Endpoint, credential: &str, body: &str) -> String {
    let key: String = credential.chars().filter(char::is_ascii_graphic).collect();
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: close\r\n\
         {API_KEY_HEADER}: {key}\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {len}\r\n\
         \r\n\
         {body}",
        path = endpoint.path,
        host = endpoint.host,
        len = body.len(),
    )
}

/// True when the response status line, or a `Status:` header, reports
/// `200 OK`.
pub fn response_accepted(response: &str) -> bool {
    response.lines().any(|line| {
        let line = line.trim();
        (line.starts_with("HTTP/") || line.starts_with("Status: ")) && line.contains("200 OK")
    })
}

/// Numeric status code from the first response line, if any.
pub fn status_code(response: &str) -> Option<u16> {
    let status_line = response.lines().next()?;
    if !status_line.starts_with("HTTP/") {
        return None;
    }
    status_line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reading() -> Reading {
        Reading {
            temperature_c: 25.0,
            humidity: 50.0,
            heat_index_c: 24.861,
            supply_volts: 3.3,
        }
    }

    #[test]
    fn form_body_uses_two_decimals() {
        assert_eq!(
            reading().form_body(),
            "field1=25.00&field2=50.00&field3=24.86&field4=3.30"
        );
    }

    #[test]
    fn request_carries_key_and_length() {
        let body = reading().form_body();
        let request = build_request(&Endpoint::thingspeak(), "ABC123", &body);

        let expected = format!(
            "POST /update.json HTTP/1.1\r\n\
             Host: api.thingspeak.com\r\n\
             Connection: close\r\n\
             X-THINGSPEAKAPIKEY: ABC123\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        );
        assert_eq!(request, expected);
    }

    #[test]
    fn credential_cannot_inject_headers() {
        let request = build_request(&Endpoint::thingspeak(), "AB\r\nX: 1", "field1=1.00");

        assert!(request.contains("\r\nX-THINGSPEAKAPIKEY: ABX:1\r\nContent-Type:"));
        assert!(!request.contains("\r\nX: 1"));
        assert_eq!(request.matches("\r\n").count(), 7);
    }

    #[test]
    fn accepts_ok_status_line() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{}";
        assert!(response_accepted(response));
        assert_eq!(status_code(response), Some(200));
    }

    #[test]
    fn accepts_legacy_status_header() {
        let response = "HTTP/1.1 200\r\nStatus: 200 OK\r\n\r\n";
        assert!(response_accepted(response));
    }

    #[test]
    fn rejects_error_status() {
        let response = "HTTP/1.1 400 Bad Request\r\nStatus: 400 Bad Request\r\n\r\n";
        assert!(!response_accepted(response));
        assert_eq!(status_code(response), Some(400));
        assert!(!response_accepted(""));
        assert_eq!(status_code(""), None);
    }
}
