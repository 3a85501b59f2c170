use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Connect to a relay server as a terminal client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// TOML configuration file. Command-line flags take precedence over it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// IP address to listen on.
    #[arg(long, short = 'a')]
    pub addr: Option<IpAddr>,

    /// TCP port to listen on (1024-65535, or 0 for an ephemeral port).
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
}

impl ServeArgs {
    /// Defaults, then the config file, then command-line overrides.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(addr) = self.addr {
            config.listen_address = addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register with the server.
    #[arg(long)]
    pub name: String,

    /// Address of the relay server.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "listen_address = \"127.0.0.1\"\nport = 9000").expect("write");

        let cli = Cli::parse_from([
            "message_relay",
            "serve",
            "--config",
            file.path().to_str().expect("utf-8 path"),
            "--port",
            "9100",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = args.resolve().expect("resolve");
        assert_eq!(config.socket_addr(), "127.0.0.1:9100".parse().unwrap());
    }

    #[test]
    fn serve_without_flags_uses_defaults() {
        let cli = Cli::parse_from(["message_relay", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.resolve().expect("resolve"), Config::default());
    }
}
