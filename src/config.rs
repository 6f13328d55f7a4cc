use std::path::PathBuf;

use crate::settings::ServerRole;

const DEFAULT_PORT: u16 = 4680;
const DEFAULT_REFRESH_HZ: u32 = 10;

#[derive(Debug)]
pub struct AppConfig {
    pub port: u16,
    pub role: ServerRole,
    /// Attribute flushes per second.
    pub refresh_hz: u32,
    pub debug: bool,
    pub settings_path: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let usage = "usage: atrium [port] [role] [refresh-hz] [settings.yaml] [log-dir]";
        let port = if args.len() > 1 {
            parse_port(&args[1]).ok_or_else(|| usage.to_string())?
        } else {
            env_value("ATRIUM_PORT")
                .and_then(|value| parse_port(&value))
                .unwrap_or(DEFAULT_PORT)
        };
        let role = if args.len() > 2 {
            ServerRole::parse(&args[2]).ok_or_else(|| usage.to_string())?
        } else {
            env_value("ATRIUM_ROLE")
                .and_then(|value| ServerRole::parse(&value))
                .unwrap_or(ServerRole::Standalone)
        };
        let refresh_hz = if args.len() > 3 {
            parse_rate(&args[3]).ok_or_else(|| usage.to_string())?
        } else {
            env_value("ATRIUM_REFRESH")
                .and_then(|value| parse_rate(&value))
                .unwrap_or(DEFAULT_REFRESH_HZ)
        };
        let settings_path = if args.len() > 4 {
            Some(PathBuf::from(&args[4]))
        } else {
            env_value("ATRIUM_SETTINGS").map(PathBuf::from)
        };
        let log_dir = if args.len() > 5 {
            PathBuf::from(&args[5])
        } else {
            env_value("ATRIUM_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("log"))
        };
        let debug = env_value("ATRIUM_DEBUG")
            .map(|value| value != "0")
            .unwrap_or(false);
        Ok(Self {
            port,
            role,
            refresh_hz,
            debug,
            settings_path,
            log_dir,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse().ok()
}

fn parse_rate(value: &str) -> Option<u32> {
    match value.trim().parse() {
        Ok(rate) if rate > 0 => Some(rate),
        _ => None,
    }
}
