use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Membership meeting coordination server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "meeting-server", version, about = "Membership meeting coordination server")]
pub struct Config {
    /// Origin to verify; "*" allows any origin
    #[arg(long, env = "MEETING_ORIGIN", default_value = "")]
    pub origin: String,

    /// PostgreSQL connection URL
    #[arg(long, env = "MEETING_DBURL", default_value = "postgres:///postgresqleu")]
    pub dburl: String,

    /// Behind proxy, decode X-Forwarded-For
    #[arg(long, env = "MEETING_BEHINDPROXY")]
    pub behindproxy: bool,

    /// Host and port to listen on; a leading / selects a UNIX socket
    #[arg(long, env = "MEETING_LISTEN", default_value = "127.0.0.1:8199")]
    pub listen: String,

    /// Optional host:port for a second diagnostic listener
    #[arg(long, env = "MEETING_PROFILE_LISTEN")]
    pub profile_listen: Option<String>,

    /// Enable structured JSON logging (for production)
    #[arg(long, env = "MEETING_JSON_LOGS")]
    pub json_logs: bool,

    /// Path to TOML config file
    #[arg(long, default_value = "./meeting-server.toml")]
    pub config: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: String::new(),
            dburl: "postgres:///postgresqleu".to_string(),
            behindproxy: false,
            listen: "127.0.0.1:8199".to_string(),
            profile_listen: None,
            json_logs: false,
            config: "./meeting-server.toml".to_string(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (MEETING_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("MEETING_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// A listen value starting with `/` names a UNIX socket path.
    pub fn listens_on_unix_socket(&self) -> bool {
        self.listen.starts_with('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_flags() {
        let config = Config::default();
        assert_eq!(config.dburl, "postgres:///postgresqleu");
        assert_eq!(config.listen, "127.0.0.1:8199");
        assert!(config.origin.is_empty());
        assert!(!config.behindproxy);
    }

    #[test]
    fn leading_slash_selects_a_unix_socket() {
        let mut config = Config::default();
        assert!(!config.listens_on_unix_socket());
        config.listen = "/run/meeting-server.sock".to_string();
        assert!(config.listens_on_unix_socket());
    }
}
