use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use dcs_core::frame::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/dsf/dcs.sock";
pub const DEFAULT_BASE_DIR: &str = "/opt/dsf/sd";

#[derive(Clone, Debug)]
pub struct Settings {
    /// Path of the command socket.
    pub socket_path: PathBuf,
    /// Directory where per-endpoint side-channel sockets are created.
    pub endpoint_dir: PathBuf,
    /// Physical root of the virtual `0:/` filesystem.
    pub base_dir: PathBuf,
    /// Namespaces third-party endpoints may not claim.
    pub reserved_namespaces: Vec<String>,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
    pub debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "dcs-daemon", about = "Control server for RepRapFirmware SBCs")]
pub struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    base_dir: String,
    #[arg(long, default_value = "")]
    endpoint_dir: String,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

pub fn load() -> Settings {
    let args = Args::parse();
    Settings::from_args(args)
}

impl Settings {
    fn from_args(args: Args) -> Self {
        let socket_path = PathBuf::from(resolve(&args.socket, "DCS_SOCKET", DEFAULT_SOCKET_PATH));
        let endpoint_dir = if args.endpoint_dir.trim().is_empty() {
            socket_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/run/dsf"))
        } else {
            PathBuf::from(args.endpoint_dir)
        };
        Self {
            socket_path,
            endpoint_dir,
            base_dir: PathBuf::from(resolve(&args.base_dir, "DCS_BASE_DIR", DEFAULT_BASE_DIR)),
            reserved_namespaces: vec!["machine".to_string()],
            max_frame_bytes: args.max_frame_bytes,
            write_timeout: Duration::from_secs(args.write_timeout),
            debug: args.debug || env_true("DCS_DEBUG"),
        }
    }

    /// Settings for tests: everything under one temp directory.
    pub fn for_test(root: PathBuf) -> Self {
        Self {
            socket_path: root.join("dcs.sock"),
            endpoint_dir: root.clone(),
            base_dir: root.join("sd"),
            reserved_namespaces: vec!["machine".to_string()],
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: Duration::from_secs(1),
            debug: false,
        }
    }
}

fn resolve(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
