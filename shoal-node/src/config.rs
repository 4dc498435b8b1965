//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shoal_core::EngineConfig;
use tracing::warn;

/// Node configuration. File: ~/.config/shoal/config.toml or /etc/shoal/config.toml.
/// Env overrides: SHOAL_LISTEN_PORT, SHOAL_DATA_DIR, SHOAL_PEERS (comma-separated addresses).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer TCP port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Pieces, torrents and the node identity live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Peers dialed at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_listen_port() -> u16 {
    45680
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/shoal"),
        None => PathBuf::from(".shoal"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
            peers: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SHOAL_LISTEN_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.listen_port = p,
            Err(_) => warn!(value = %s, "Ignoring invalid SHOAL_LISTEN_PORT"),
        }
    }
    if let Some(s) = var("SHOAL_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("SHOAL_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter_map(|p| match p.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(value = %p, "Ignoring invalid peer address");
                    None
                }
            })
            .collect();
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shoal/config.toml"));
    }
    out.push(PathBuf::from("/etc/shoal/config.toml"));
    out
}

/// First existing file wins; a file that fails to parse falls back to defaults.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    parse_file(path)
}

fn parse_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not parse config");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_file_with_engine_section() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 5000
            data_dir = "/var/lib/shoal"
            peers = ["10.0.0.2:45680"]

            [engine]
            piece_size = 65536
            unchoke_slots = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/shoal"));
        assert_eq!(c.peers, vec!["10.0.0.2:45680".parse().unwrap()]);
        assert_eq!(c.engine.piece_size, 65536);
        assert_eq!(c.engine.unchoke_slots, 3);
        assert_eq!(c.engine.max_in_flight, EngineConfig::default().max_in_flight);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("listen_prot = 45680").is_err());
        assert!(toml::from_str::<Config>("[engine]\nchunk_size = 1").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SHOAL_LISTEN_PORT", "6000"),
            ("SHOAL_DATA_DIR", "/tmp/shoal"),
            ("SHOAL_PEERS", "127.0.0.1:1, bogus ,127.0.0.1:2"),
        ]);
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/shoal"));
        assert_eq!(
            c.peers,
            vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()]
        );
    }

    #[test]
    fn invalid_port_keeps_default() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "SHOAL_LISTEN_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(c.listen_port, 45680);
    }

    #[test]
    fn first_existing_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("config.toml");
        std::fs::write(&present, "listen_port = 7000").unwrap();
        let c = load_file(&[missing, present]).unwrap();
        assert_eq!(c.listen_port, 7000);
    }
}
