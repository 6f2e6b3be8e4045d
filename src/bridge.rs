// src/bridge.rs
//
// Startup glue: command line, settings, port selection, telemetry and the
// WebSocket server, plus the Ctrl-C shutdown path.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use crate::credentials;
use crate::io::serial::{list_ports, open_port, select_port, SerialPortInfo};
use crate::io::{serve, Relay, RelayConfig};
use crate::logging;
use crate::settings::{self, BridgeSettings, InfluxSettings};
use crate::telemetry::{InfluxConfig, InfluxSink, InfluxWriterHandle, TelemetrySink};

/// Environment variable consulted for the InfluxDB token.
const TOKEN_ENV_VAR: &str = "TA612C_INFLUX_TOKEN";
const TOKEN_FIELD: &str = "token";

#[derive(Parser, Debug)]
#[command(name = "ta612c-bridge", version)]
#[command(about = "Bridge a TA612C thermometer's serial port to WebSocket clients")]
pub struct Cli {
    /// Serial port of the TA612C (auto-detected when omitted)
    pub port: Option<String>,

    /// Settings file (defaults to <config dir>/ta612c-bridge/bridge.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address the WebSocket server binds to
    #[arg(long)]
    pub host: Option<String>,

    /// WebSocket server port
    #[arg(long)]
    pub ws_port: Option<u16>,

    /// Also write the log to a timestamped file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Disable InfluxDB logging even when configured
    #[arg(long)]
    pub no_influx: bool,

    /// Print the available serial ports and exit
    #[arg(long)]
    pub list_ports: bool,

    /// Read an InfluxDB token from stdin, store it in the keyring and exit
    #[arg(long, conflicts_with = "clear_token")]
    pub store_token: bool,

    /// Remove the stored InfluxDB token from the keyring and exit
    #[arg(long)]
    pub clear_token: bool,
}

/// Effective configuration after merging the command line over settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub serial_port: Option<String>,
    pub ws_host: String,
    pub ws_port: u16,
    pub log_dir: Option<PathBuf>,
    pub influxdb: Option<InfluxSettings>,
}

/// Command line values win over the settings file, which wins over defaults.
pub fn resolve_config(cli: &Cli, settings: BridgeSettings) -> BridgeConfig {
    BridgeConfig {
        serial_port: cli.port.clone().or(settings.serial_port),
        ws_host: cli.host.clone().unwrap_or(settings.ws_host),
        ws_port: cli.ws_port.unwrap_or(settings.ws_port),
        log_dir: cli.log_dir.clone().or(settings.log_dir),
        influxdb: if cli.no_influx { None } else { settings.influxdb },
    }
}

/// Token lookup order: settings file, environment, keyring.
/// Blank values are skipped.
fn pick_token<F>(configured: Option<&str>, env: Option<String>, keyring: F) -> Result<Option<String>, String>
where
    F: FnOnce() -> Result<Option<String>, String>,
{
    let non_blank = |s: String| {
        let trimmed = s.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };

    if let Some(token) = configured.map(str::to_string).and_then(non_blank) {
        return Ok(Some(token));
    }
    if let Some(token) = env.and_then(non_blank) {
        return Ok(Some(token));
    }
    Ok(keyring()?.and_then(non_blank))
}

fn resolve_token(influx: &InfluxSettings) -> Result<Option<String>, String> {
    pick_token(
        influx.token.as_deref(),
        std::env::var(TOKEN_ENV_VAR).ok(),
        || credentials::get_credential(&influx.credential_profile(), TOKEN_FIELD),
    )
}

/// Build the InfluxDB connection details, or explain why logging is off.
fn influx_config(influx: &InfluxSettings) -> Result<InfluxConfig, String> {
    let missing = influx.missing_fields();
    if !missing.is_empty() {
        return Err(format!("[influxdb] is missing {}", missing.join(", ")));
    }

    let token = resolve_token(influx)?.ok_or_else(|| {
        format!(
            "no token (set it in the settings file, {} or with --store-token)",
            TOKEN_ENV_VAR
        )
    })?;

    Ok(InfluxConfig {
        url: influx.url.clone(),
        org: influx.org.clone(),
        bucket: influx.bucket.clone(),
        token,
        measurement: influx.measurement.clone(),
    })
}

/// Start InfluxDB logging when configured. Any failure leaves the bridge
/// running without telemetry.
async fn start_telemetry(
    influx: Option<&InfluxSettings>,
) -> Option<(Arc<InfluxSink>, InfluxWriterHandle)> {
    let Some(influx) = influx else {
        tlog!("[influx] InfluxDB logging disabled");
        return None;
    };

    let config = match influx_config(influx) {
        Ok(config) => config,
        Err(e) => {
            tlog!("[influx] InfluxDB logging disabled: {}", e);
            return None;
        }
    };

    let target = format!("{} (org={}, bucket={})", config.url, config.org, config.bucket);
    match InfluxSink::connect(config).await {
        Ok(sink) => {
            tlog!("[influx] Logging readings to {}", target);
            Some(sink)
        }
        Err(e) => {
            tlog!("[influx] InfluxDB logging disabled, {}: {}", target, e);
            None
        }
    }
}

fn print_ports(ports: &[SerialPortInfo]) {
    if ports.is_empty() {
        println!("No serial ports found.");
        return;
    }
    for port in ports {
        println!("{}", port.describe());
    }
}

/// Keyring profile for the configured org/bucket.
fn token_profile(influx: Option<&InfluxSettings>) -> Result<String, String> {
    let influx = influx.ok_or("No [influxdb] table in the settings file")?;
    let missing = influx.missing_fields();
    if !missing.is_empty() {
        return Err(format!("[influxdb] is missing {}", missing.join(", ")));
    }
    Ok(influx.credential_profile())
}

fn store_token(influx: Option<&InfluxSettings>) -> Result<(), String> {
    let profile = token_profile(influx)?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| format!("Failed to read token from stdin: {}", e))?;
    let token = line.trim();
    if token.is_empty() {
        return Err("Empty token".to_string());
    }

    credentials::store_credential(&profile, TOKEN_FIELD, token)?;
    println!("Token stored for {}", profile);
    Ok(())
}

fn clear_token(influx: Option<&InfluxSettings>) -> Result<(), String> {
    let profile = token_profile(influx)?;
    credentials::delete_credential(&profile, TOKEN_FIELD)?;
    println!("Token removed for {}", profile);
    Ok(())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), String> {
    let ports = match config.serial_port {
        Some(_) => Vec::new(),
        None => list_ports()?,
    };
    let port_name = select_port(config.serial_port.as_deref(), &ports)?;
    let serial = Arc::new(open_port(&port_name)?);
    tlog!("[serial] Opened {}", port_name);

    let telemetry = start_telemetry(config.influxdb.as_ref()).await;
    let (sink, writer) = match telemetry {
        Some((sink, writer)) => (Some(sink as Arc<dyn TelemetrySink>), Some(writer)),
        None => (None, None),
    };

    let listener = TcpListener::bind((config.ws_host.as_str(), config.ws_port))
        .await
        .map_err(|e| {
            format!(
                "Failed to listen on {}:{}: {}",
                config.ws_host, config.ws_port, e
            )
        })?;
    tlog!(
        "[server] Listening on ws://{}:{}",
        config.ws_host,
        config.ws_port
    );

    let relay = Arc::new(Relay::new(serial, sink, RelayConfig::default()));

    tokio::select! {
        _ = serve(listener, relay) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tlog!("[server] Failed to wait for Ctrl-C: {}", e);
            }
            tlog!("[server] Shutting down...");
        }
    }

    if let Some(writer) = writer {
        writer.shutdown().await;
    }
    tlog!("Bridge stopped.");
    Ok(())
}

/// Run the bridge for the given command line. Returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    let settings = match settings::load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[settings] {}", e);
            return 1;
        }
    };
    let config = resolve_config(&cli, settings);

    if cli.list_ports {
        return match list_ports() {
            Ok(ports) => {
                print_ports(&ports);
                0
            }
            Err(e) => {
                tlog!("[serial] {}", e);
                1
            }
        };
    }

    if cli.store_token || cli.clear_token {
        let result = if cli.store_token {
            store_token(config.influxdb.as_ref())
        } else {
            clear_token(config.influxdb.as_ref())
        };
        return match result {
            Ok(()) => 0,
            Err(e) => {
                tlog!("[credentials] {}", e);
                1
            }
        };
    }

    if let Some(dir) = &config.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            tlog!("[logging] {}", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tlog!("Failed to start async runtime: {}", e);
            return 1;
        }
    };

    let code = match runtime.block_on(run_bridge(config)) {
        Ok(()) => 0,
        Err(e) => {
            tlog!("{}", e);
            1
        }
    };
    logging::stop_file_logging();
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["ta612c-bridge"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn influx_settings() -> InfluxSettings {
        InfluxSettings {
            url: "http://influx.local:8086".to_string(),
            org: "lab".to_string(),
            bucket: "sensors".to_string(),
            measurement: "ta612c".to_string(),
            token: Some("from-settings".to_string()),
        }
    }

    #[test]
    fn test_defaults_without_arguments() {
        let config = resolve_config(&parse(&[]), BridgeSettings::default());
        assert_eq!(config.serial_port, None);
        assert_eq!(config.ws_host, "localhost");
        assert_eq!(config.ws_port, 8767);
        assert_eq!(config.log_dir, None);
        assert_eq!(config.influxdb, None);
    }

    #[test]
    fn test_command_line_overrides_settings() {
        let settings = BridgeSettings {
            serial_port: Some("/dev/ttyUSB0".to_string()),
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
            log_dir: Some(PathBuf::from("/var/log/bridge")),
            influxdb: Some(influx_settings()),
        };

        let cli = parse(&["/dev/ttyUSB3", "--ws-port", "9100", "--no-influx"]);
        let config = resolve_config(&cli, settings);

        assert_eq!(config.serial_port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(config.ws_host, "0.0.0.0");
        assert_eq!(config.ws_port, 9100);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/bridge")));
        assert_eq!(config.influxdb, None);
    }

    #[test]
    fn test_flags_parse() {
        let cli = parse(&["--list-ports", "--host", "127.0.0.1", "--log-dir", "/tmp/logs"]);
        assert!(cli.list_ports);
        assert!(!cli.store_token);
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert!(Cli::try_parse_from(["ta612c-bridge", "--ws-port", "notaport"]).is_err());
        assert!(Cli::try_parse_from(["ta612c-bridge", "--store-token", "--clear-token"]).is_err());
    }

    #[test]
    fn test_token_lookup_order() {
        let keyring = || Ok(Some("from-keyring".to_string()));

        assert_eq!(
            pick_token(Some("from-settings"), Some("from-env".to_string()), keyring).unwrap(),
            Some("from-settings".to_string())
        );
        assert_eq!(
            pick_token(None, Some("from-env".to_string()), keyring).unwrap(),
            Some("from-env".to_string())
        );
        assert_eq!(
            pick_token(Some("  "), None, keyring).unwrap(),
            Some("from-keyring".to_string())
        );
        assert_eq!(pick_token(None, None, || Ok(None)).unwrap(), None);
        assert!(pick_token(None, None, || Err("locked".to_string())).is_err());
    }

    #[test]
    fn test_influx_config_from_settings() {
        let config = influx_config(&influx_settings()).unwrap();
        assert_eq!(config.url, "http://influx.local:8086");
        assert_eq!(config.token, "from-settings");
        assert_eq!(config.measurement, "ta612c");

        let mut incomplete = influx_settings();
        incomplete.bucket.clear();
        let err = influx_config(&incomplete).unwrap_err();
        assert!(err.contains("bucket"));
    }

    #[test]
    fn test_token_profile_requires_influx_table() {
        assert!(token_profile(None).is_err());
        assert_eq!(
            token_profile(Some(&influx_settings())).unwrap(),
            "influxdb/lab/sensors"
        );
    }

    #[tokio::test]
    async fn test_telemetry_disabled_without_settings() {
        assert!(start_telemetry(None).await.is_none());
    }
}
