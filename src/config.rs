//! Command-line configuration.
//!
//! Every runtime knob arrives as a flag (there is no config file; the
//! daemon is deployed as a single systemd unit next to the beamline
//! detector). Parsed flags are validated into an [`AppConfig`], and a
//! non-empty `--detector-ip` derives both the ZMQ endpoint and the
//! SIMPLON base URL.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{AppResult, StxmError};

/// Default threshold channels advertised before a `start` message names
/// its own.
pub const DEFAULT_THRESHOLDS: [&str; 2] = ["threshold_0", "threshold_1"];

#[derive(Debug, Parser)]
#[command(name = "stxm-map")]
#[command(about = "Real-time STXM map acquisition daemon", long_about = None)]
pub struct Cli {
    /// HTTP port for the web UI
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Detector IP used for ZMQ and SIMPLON API endpoints
    #[arg(long, default_value = "")]
    pub detector_ip: String,

    /// SIMPLON API port
    #[arg(long, default_value_t = 80)]
    pub api_port: u16,

    /// SIMPLON API version
    #[arg(long = "simplon-api-version", default_value = "1.8.0")]
    pub api_version: String,

    /// ZMQ port
    #[arg(long, default_value_t = 31001)]
    pub zmq_port: u16,

    /// ZMQ endpoint (used when --detector-ip is empty)
    #[arg(long, default_value = "tcp://localhost:31001")]
    pub endpoint: String,

    /// Polling interval for SIMPLON status
    #[arg(long = "simplon-interval", default_value = "1s", value_parser = humantime::parse_duration)]
    pub simplon_interval: Duration,

    /// Number of processing workers
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Grid width in pixels
    #[arg(long, default_value_t = 52)]
    pub grid_x: usize,

    /// Grid height in pixels
    #[arg(long, default_value_t = 52)]
    pub grid_y: usize,

    /// Run with simulated data
    #[arg(long)]
    pub debug: bool,

    /// Simulated acquisition rate (frames/sec)
    #[arg(long, default_value_t = 100.0)]
    pub debug_acq_rate: f64,

    /// UI update interval for websocket clients
    #[arg(long = "ui-rate", default_value = "1s", value_parser = humantime::parse_duration)]
    pub ui_rate: Duration,

    /// Directory for output data files
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Write raw CBOR messages to disk
    #[arg(long = "raw-log")]
    pub raw_log_enabled: bool,

    /// Directory for raw ingest logs
    #[arg(long, default_value = "rawlog")]
    pub raw_log_dir: PathBuf,

    /// Log every Nth ingest error
    #[arg(long, default_value_t = 100)]
    pub ingest_log_every: u64,

    /// Fall back to the simulator when ingest fails
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ingest_fallback: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub detector_ip: String,
    pub api_port: u16,
    pub api_version: String,
    pub zmq_port: u16,
    pub endpoint: String,
    pub simplon_base_url: String,
    pub simplon_interval: Duration,
    pub workers: usize,
    pub grid_x: usize,
    pub grid_y: usize,
    pub debug: bool,
    pub debug_acq_rate: f64,
    pub ui_rate: Duration,
    pub output_dir: PathBuf,
    pub raw_log_enabled: bool,
    pub raw_log_dir: PathBuf,
    pub ingest_log_every: u64,
    pub ingest_fallback: bool,
    pub thresholds: Vec<String>,
}

impl AppConfig {
    /// Validate parsed flags and resolve derived endpoints.
    pub fn from_cli(cli: Cli) -> AppResult<Self> {
        if cli.grid_x < 1 || cli.grid_y < 1 {
            return Err(StxmError::ConfigInvalid(format!(
                "grid dimensions must be positive, got {}x{}",
                cli.grid_x, cli.grid_y
            )));
        }
        if !(cli.debug_acq_rate > 0.0) {
            return Err(StxmError::ConfigInvalid(format!(
                "debug acquisition rate must be positive, got {}",
                cli.debug_acq_rate
            )));
        }

        let (endpoint, simplon_base_url) = if cli.detector_ip.is_empty() {
            (cli.endpoint, String::new())
        } else {
            (
                format!("tcp://{}:{}", cli.detector_ip, cli.zmq_port),
                format!("http://{}:{}", cli.detector_ip, cli.api_port),
            )
        };

        let ui_rate = if cli.ui_rate.is_zero() {
            Duration::from_secs(1)
        } else {
            cli.ui_rate
        };

        Ok(Self {
            port: cli.port,
            detector_ip: cli.detector_ip,
            api_port: cli.api_port,
            api_version: cli.api_version,
            zmq_port: cli.zmq_port,
            endpoint,
            simplon_base_url,
            simplon_interval: cli.simplon_interval,
            workers: cli.workers.max(1),
            grid_x: cli.grid_x,
            grid_y: cli.grid_y,
            debug: cli.debug,
            debug_acq_rate: cli.debug_acq_rate,
            ui_rate,
            output_dir: cli.output_dir,
            raw_log_enabled: cli.raw_log_enabled,
            raw_log_dir: cli.raw_log_dir,
            ingest_log_every: cli.ingest_log_every.max(1),
            ingest_fallback: cli.ingest_fallback,
            thresholds: DEFAULT_THRESHOLDS.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Endpoint pair pushed through the reconfiguration watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUpdate {
    pub endpoint: String,
    pub simplon_base_url: String,
}

#[derive(Debug)]
struct SharedConfigState {
    grid_x: usize,
    grid_y: usize,
    thresholds: Vec<String>,
    detector_ip: String,
    zmq_port: u16,
    api_port: u16,
    endpoint: String,
    simplon_base_url: String,
    port: u16,
}

/// Runtime-mutable configuration visible to the UI.
///
/// Grid dimensions and the detector endpoint can change while the daemon
/// runs; this record is the single source the `/config` endpoint and the
/// websocket config envelope read from.
#[derive(Debug)]
pub struct SharedConfig {
    inner: Mutex<SharedConfigState>,
}

impl SharedConfig {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            inner: Mutex::new(SharedConfigState {
                grid_x: cfg.grid_x,
                grid_y: cfg.grid_y,
                thresholds: cfg.thresholds.clone(),
                detector_ip: cfg.detector_ip.clone(),
                zmq_port: cfg.zmq_port,
                api_port: cfg.api_port,
                endpoint: cfg.endpoint.clone(),
                simplon_base_url: cfg.simplon_base_url.clone(),
                port: cfg.port,
            }),
        }
    }

    pub fn grid(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.grid_x, inner.grid_y)
    }

    pub fn set_grid(&self, grid_x: usize, grid_y: usize) {
        let mut inner = self.inner.lock();
        inner.grid_x = grid_x;
        inner.grid_y = grid_y;
    }

    pub fn thresholds(&self) -> Vec<String> {
        self.inner.lock().thresholds.clone()
    }

    pub fn set_thresholds(&self, thresholds: Vec<String>) {
        self.inner.lock().thresholds = thresholds;
    }

    /// Apply a new detector endpoint, returning the derived update for the
    /// transport and the SIMPLON poller.
    pub fn set_endpoint(
        &self,
        detector_ip: &str,
        zmq_port: u16,
        api_port: u16,
    ) -> AppResult<EndpointUpdate> {
        if detector_ip.is_empty() || zmq_port < 1 || api_port < 1 {
            return Err(StxmError::ConfigInvalid(
                "invalid endpoint configuration".into(),
            ));
        }
        let mut inner = self.inner.lock();
        inner.detector_ip = detector_ip.to_string();
        inner.zmq_port = zmq_port;
        inner.api_port = api_port;
        inner.endpoint = format!("tcp://{detector_ip}:{zmq_port}");
        inner.simplon_base_url = format!("http://{detector_ip}:{api_port}");
        Ok(EndpointUpdate {
            endpoint: inner.endpoint.clone(),
            simplon_base_url: inner.simplon_base_url.clone(),
        })
    }

    pub fn endpoint_update(&self) -> EndpointUpdate {
        let inner = self.inner.lock();
        EndpointUpdate {
            endpoint: inner.endpoint.clone(),
            simplon_base_url: inner.simplon_base_url.clone(),
        }
    }

    /// Config payload shape shared by `GET /config` and the websocket
    /// greeting.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "type": "config",
            "grid_x": inner.grid_x,
            "grid_y": inner.grid_y,
            "thresholds": inner.thresholds,
            "detector_ip": inner.detector_ip,
            "zmq_port": inner.zmq_port,
            "api_port": inner.api_port,
            "endpoint": inner.endpoint,
            "simplon_base_url": inner.simplon_base_url,
            "port": inner.port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppResult<AppConfig> {
        let mut full = vec!["stxm-map"];
        full.extend_from_slice(args);
        AppConfig::from_cli(Cli::parse_from(full))
    }

    #[test]
    fn detector_ip_derives_endpoints() {
        let cfg = parse(&["--detector-ip", "10.0.0.7", "--zmq-port", "31001"]).unwrap();
        assert_eq!(cfg.endpoint, "tcp://10.0.0.7:31001");
        assert_eq!(cfg.simplon_base_url, "http://10.0.0.7:80");
    }

    #[test]
    fn explicit_endpoint_survives_without_detector_ip() {
        let cfg = parse(&["--endpoint", "tcp://sim:9000"]).unwrap();
        assert_eq!(cfg.endpoint, "tcp://sim:9000");
        assert!(cfg.simplon_base_url.is_empty());
    }

    #[test]
    fn zero_grid_is_rejected() {
        assert!(matches!(
            parse(&["--grid-x", "0"]),
            Err(StxmError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn workers_and_log_every_clamp_to_one() {
        let cfg = parse(&["--workers", "0", "--ingest-log-every", "0"]).unwrap();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.ingest_log_every, 1);
    }

    #[test]
    fn shared_config_endpoint_update_derives_urls() {
        let cfg = parse(&[]).unwrap();
        let shared = SharedConfig::new(&cfg);
        let update = shared.set_endpoint("10.1.2.3", 31001, 8080).unwrap();
        assert_eq!(update.endpoint, "tcp://10.1.2.3:31001");
        assert_eq!(update.simplon_base_url, "http://10.1.2.3:8080");
        assert_eq!(shared.to_json()["detector_ip"], "10.1.2.3");
    }

    #[test]
    fn shared_config_rejects_empty_ip() {
        let cfg = parse(&[]).unwrap();
        let shared = SharedConfig::new(&cfg);
        assert!(shared.set_endpoint("", 1, 1).is_err());
    }
}
