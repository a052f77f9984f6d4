/* This file is part of Retro
 *
 * Copyright (C) 2023-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Client configuration.
//!
//! Read from the INI file at `~/.retro/config.txt`:
//!
//! ```ini
//! [default]
//! loglevel = info
//! logfile = ~/.retro/log.txt
//! recv_timeout = 5
//!
//! [server]
//! address = 127.0.0.1
//! hostname = example.org
//! port = 8443
//! fileport = 8444
//! certificate = ~/.retro/server-cert.pem
//! ```

use std::{collections::HashMap, fs, path::PathBuf};

use log::{debug, LevelFilter};

use crate::{
    util::path::{download_dir, expand_path, home_dir},
    Error, Result,
};

/// Name of the base directory below the user's home
const BASEDIR_NAME: &str = ".retro";
/// Name of the config file inside the base directory
const CONFIG_FILE_NAME: &str = "config.txt";

/// Maximum size of a transferable file (1 GiB)
pub const RETRO_MAX_FILESIZE: u64 = 0x4000_0000;

/// Client settings with their on-disk locations.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory (`~/.retro`)
    pub base_dir: PathBuf,
    /// Path of the config file
    pub config_file: PathBuf,
    /// Directory holding all local accounts
    pub accounts_dir: PathBuf,
    /// Directory downloaded files are stored to
    pub download_dir: PathBuf,

    // [default]
    pub loglevel: LevelFilter,
    pub logfile: PathBuf,
    /// Printf-style log format. Each known token toggles the matching
    /// record field in the log output, the field order itself is fixed.
    pub logformat: String,
    /// Receive timeout in seconds
    pub recv_timeout: u64,

    // [server]
    pub server_address: String,
    /// TLS SNI / verification name
    pub server_hostname: String,
    pub server_port: u16,
    pub server_fileport: u16,
    /// Reserved for audio calls
    pub server_audioport: u16,
    pub server_certfile: PathBuf,
}

impl Config {
    /// Build a config with default values under the given base directory,
    /// or `~/.retro` if none is given.
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => home_dir()?.join(BASEDIR_NAME),
        };

        Ok(Self {
            config_file: base_dir.join(CONFIG_FILE_NAME),
            accounts_dir: base_dir.join("accounts"),
            download_dir: download_dir(&base_dir)?,
            loglevel: LevelFilter::Info,
            logfile: base_dir.join("log.txt"),
            logformat: "%(levelname)s  %(message)s".to_string(),
            recv_timeout: 5,
            server_address: "127.0.0.1".to_string(),
            server_hostname: "127.0.0.1".to_string(),
            server_port: 8443,
            server_fileport: 8444,
            server_audioport: 8445,
            server_certfile: base_dir.join("server-cert.pem"),
            base_dir,
        })
    }

    /// Read the config file, overriding the defaults with any keys found.
    /// A missing config file keeps the defaults.
    pub fn load(&mut self) -> Result<()> {
        if !self.config_file.exists() {
            debug!(target: "retro::config", "No config file at {:?}, using defaults", self.config_file);
            return Ok(())
        }

        debug!(target: "retro::config", "Loading configs from {:?}", self.config_file);
        let data = fs::read_to_string(&self.config_file)?;
        let sections = parse_ini(&data);

        if let Some(default) = sections.get("default") {
            if let Some(level) = default.get("loglevel") {
                self.loglevel = parse_loglevel(level)?;
            }
            if let Some(file) = default.get("logfile") {
                self.logfile = expand_path(file)?;
            }
            if let Some(fmt) = default.get("logformat") {
                self.logformat = fmt.clone();
            }
            if let Some(timeout) = default.get("recv_timeout") {
                self.recv_timeout = parse_num(timeout, "recv_timeout")?;
            }
        }

        if let Some(server) = sections.get("server") {
            if let Some(address) = server.get("address") {
                self.server_address = address.clone();
                // The hostname defaults to the address unless set explicitly
                if !server.contains_key("hostname") {
                    self.server_hostname = address.clone();
                }
            }
            if let Some(hostname) = server.get("hostname") {
                self.server_hostname = hostname.clone();
            }
            if let Some(port) = server.get("port") {
                self.server_port = parse_num(port, "port")?;
            }
            if let Some(port) = server.get("fileport") {
                self.server_fileport = parse_num(port, "fileport")?;
            }
            if let Some(port) = server.get("audioport") {
                self.server_audioport = parse_num(port, "audioport")?;
            }
            if let Some(cert) = server.get("certificate") {
                self.server_certfile = expand_path(cert)?;
            }
        }

        Ok(())
    }

    /// Path of the directory holding a single account.
    pub fn account_dir(&self, username: &str) -> PathBuf {
        self.accounts_dir.join(username)
    }
}

/// Minimal INI section/key scanner.
///
/// Understands `[section]` lines, `key = value` pairs, and `#`/`;`
/// comments. Keys before the first section header are ignored.
fn parse_ini(data: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_lowercase();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue
        }

        let Some(section) = &current else { continue };
        let Some((key, value)) = line.split_once('=') else { continue };

        sections
            .get_mut(section)
            .expect("section exists")
            .insert(key.trim().to_lowercase(), value.trim().to_string());
    }

    sections
}

fn parse_loglevel(s: &str) -> Result<LevelFilter> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::Error),
        "warning" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        x => Err(Error::ConfigError(format!("invalid loglevel '{}'", x))),
    }
}

fn parse_num<T: std::str::FromStr>(s: &str, key: &str) -> Result<T> {
    s.parse().map_err(|_| Error::ConfigError(format!("invalid value '{}' for {}", s, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ini() {
        let data = r#"
# comment
[default]
loglevel = debug
recv_timeout = 10

[server]
address = relay.example.org
port = 9999
; another comment
"#;
        let sections = parse_ini(data);
        assert_eq!(sections["default"]["loglevel"], "debug");
        assert_eq!(sections["default"]["recv_timeout"], "10");
        assert_eq!(sections["server"]["address"], "relay.example.org");
        assert_eq!(sections["server"]["port"], "9999");
    }

    #[test]
    fn test_config_load_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("retro_conf_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(CONFIG_FILE_NAME),
            "[default]\nloglevel = error\nrecv_timeout = 30\n\n\
             [server]\naddress = 10.0.0.1\nport = 1234\nfileport = 1235\n",
        )
        .unwrap();

        let mut conf = Config::new(Some(dir.clone())).unwrap();
        conf.load().unwrap();

        assert_eq!(conf.loglevel, LevelFilter::Error);
        assert_eq!(conf.recv_timeout, 30);
        assert_eq!(conf.server_address, "10.0.0.1");
        // hostname follows address when not set explicitly
        assert_eq!(conf.server_hostname, "10.0.0.1");
        assert_eq!(conf.server_port, 1234);
        assert_eq!(conf.server_fileport, 1235);
        // untouched keys keep their defaults
        assert_eq!(conf.server_audioport, 8445);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let dir = std::env::temp_dir().join(format!("retro_conf_bad_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE_NAME), "[default]\nloglevel = chatty\n").unwrap();

        let mut conf = Config::new(Some(dir.clone())).unwrap();
        assert!(matches!(conf.load(), Err(Error::ConfigError(_))));

        let _ = fs::remove_dir_all(&dir);
    }
}
