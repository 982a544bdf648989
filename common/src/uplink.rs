//! Single-shot telemetry upload over a raw TCP connection.

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{info, warn};
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::telemetry::{build_request, response_accepted, status_code};
use crate::types::Reading;

const MAX_RESPONSE_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("wifi not connected")]
    NotConnected,
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("i/o error during upload: {0}")]
    Io(#[from] io::Error),
    #[error("server rejected update (status {status:?})")]
    Rejected { status: Option<u16> },
}

/// Link to the outside world: WiFi status plus outbound TCP.
pub trait Network {
    type Stream: Read + Write;

    fn is_connected(&self) -> bool;
    fn connect(&mut self, host: &str, port: u16) -> io::Result<Self::Stream>;
}

/// [`Network`] backed by `std::net::TcpStream`. `link_up` reports whether the
/// underlying WiFi station is associated.
pub struct TcpNetwork<F> {
    link_up: F,
    timeout: Duration,
}

impl<F: Fn() -> bool> TcpNetwork<F> {
    pub fn new(link_up: F, timeout: Duration) -> Self {
        Self { link_up, timeout }
    }
}

impl<F: Fn() -> bool> Network for TcpNetwork<F> {
    type Stream = TcpStream;

    fn is_connected(&self) -> bool {
        (self.link_up)()
    }

    fn connect(&mut self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        }))
    }
}

/// Posts one reading. Never retries; the next wake cycle is the retry.
pub fn upload<N: Network>(
    network: &mut N,
    endpoint: &Endpoint,
    credential: &str,
    reading: &Reading,
) -> Result<(), UploadError> {
    if !network.is_connected() {
        return Err(UploadError::NotConnected);
    }

    let mut stream =
        network
            .connect(&endpoint.host, endpoint.port)
            .map_err(|source| UploadError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                source,
            })?;

    let body = reading.form_body();
    let request = build_request(endpoint, credential, &body);
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let response = read_response(&mut stream)?;
    if response_accepted(&response) {
        info!("upload accepted by {}", endpoint.host);
        Ok(())
    } else {
        let status = status_code(&response);
        warn!("upload rejected by {} (status {:?})", endpoint.host, status);
        Err(UploadError::Rejected { status })
    }
}

fn read_response<S: Read>(stream: &mut S) -> io::Result<String> {
    let mut response = Vec::with_capacity(512);
    let mut chunk = [0_u8; 256];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // Server kept the socket open after replying.
            Err(err)
                if !response.is_empty()
                    && matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
            {
                break
            }
            Err(err) => return Err(err),
        };
        if read == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read]);
        if response.len() >= MAX_RESPONSE_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}
