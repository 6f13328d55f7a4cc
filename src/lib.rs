pub mod admin;
mod config;
pub mod net;
pub mod settings;
pub mod telemetry;
pub mod world;

pub use net::cipher::{CipherStream, DEFAULT_CIPHER_SEED};
pub use net::records::{Fault, Record};
pub use net::server::{run_server, ServerConfig, ServerControl};
pub use settings::{ServerRole, ServerSettings};
pub use world::registry::Registry;

pub fn run(args: &[String]) -> Result<(), String> {
    let config = config::AppConfig::from_args(args)?;
    telemetry::logging::init(&config.log_dir, config.debug)?;

    let settings = match &config.settings_path {
        Some(path) => match settings::ServerSettings::load(path)? {
            Some(settings) => {
                println!("atrium: settings loaded from {}", path.display());
                settings
            }
            None => {
                println!(
                    "atrium: settings file {} not found, using defaults",
                    path.display()
                );
                settings::ServerSettings::default()
            }
        },
        None => settings::ServerSettings::default(),
    };

    println!(
        "atrium: {} {}",
        settings.product_name,
        net::records::pretty_version(settings.product_version_int())
    );
    println!("- role: {}", config.role.name());
    println!(
        "- protocol: {} {}",
        settings.protocol_name,
        net::records::pretty_version(settings.protocol_version_int())
    );
    println!("- users: {}", settings.users.len());
    println!("- world overrides: {}", settings.worlds.len());
    println!("- refresh: {} Hz", config.refresh_hz);

    let registry = std::sync::Arc::new(std::sync::Mutex::new(world::registry::Registry::new(
        settings,
        config.role,
    )));
    let control = std::sync::Arc::new(net::server::ServerControl::new());
    let server_config = net::server::ServerConfig {
        bind_addr: config.bind_addr(),
        refresh_hz: config.refresh_hz,
        read_timeout: std::time::Duration::from_millis(50),
    };
    net::server::run_server(server_config, registry, control)
}
