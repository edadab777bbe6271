/*   Copyright 2024 Perry Lorier
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 *
 *  SPDX-License-Identifier: Apache-2.0
 *
 *  Tunnel configuration parsing.
 */
use crate::dns::answer::AnswerMode;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use yaml_rust::yaml;
use yaml_rust::yaml::YamlLoader;

pub const MAX_DNS_SERVERS: usize = 2;
pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_MAX_SOCKETS: usize = 1024;
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    Utf8Error(std::string::FromUtf8Error),
    YamlError(yaml_rust::scanner::ScanError),
    MissingConfig,
    MultipleConfigs,
    ConfigProcessFailed,
    InvalidConfig(String),
}

impl Error {
    pub fn annotate(self, prefix: &str) -> Error {
        match self {
            Error::InvalidConfig(msg) => Error::InvalidConfig(format!("{}: {}", prefix, msg)),
            x => x,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O Error reading configuration file: {}", e),
            Error::Utf8Error(e) => {
                write!(f, "UTF8 Decoding error reading configuration file: {}", e)
            }
            Error::YamlError(e) => write!(f, "Yaml parse error while reading configuration: {}", e),
            Error::MissingConfig => write!(f, "Configuration is empty/missing"),
            Error::MultipleConfigs => {
                write!(f, "Configuration file contains multiple configurations")
            }
            Error::ConfigProcessFailed => write!(f, "Configuration process failed"),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// The parts of the configuration the tunnel can pick up while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dns_servers: Vec<SocketAddrV4>,
    pub answer: AnswerMode,
    pub cname_blocking: bool,
    pub powersave: bool,
}

impl Settings {
    pub fn new(dns_servers: Vec<SocketAddrV4>) -> Self {
        Self {
            dns_servers,
            answer: AnswerMode::default(),
            cname_blocking: false,
            powersave: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub max_sockets: usize,
    pub timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub forwarder: ForwarderConfig,
}

impl Config {
    pub fn settings(&self) -> Settings {
        self.settings.clone()
    }
}

fn parse_string(name: &str, fragment: &yaml::Yaml) -> Result<Option<String>, Error> {
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::String(s) => Ok(Some(s.into())),
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected String, got '{:?}'",
            name, e
        ))),
    }
}

fn parse_boolean(name: &str, fragment: &yaml::Yaml) -> Result<Option<bool>, Error> {
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::Boolean(b) => Ok(Some(*b)),
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected Boolean, got '{:?}'",
            name, e
        ))),
    }
}

fn parse_number(name: &str, fragment: &yaml::Yaml) -> Result<Option<i64>, Error> {
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::Integer(i) => Ok(Some(*i)),
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected Number, got '{:?}'",
            name, e
        ))),
    }
}

fn str_duration(name: &str, s: &str) -> Result<Duration, Error> {
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let num: u64 = num
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{}: Invalid duration {:?}: {}", name, s, e)))?;
    let mult = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => {
            return Err(Error::InvalidConfig(format!(
                "{}: Unknown duration unit {:?}",
                name, unit
            )))
        }
    };
    let secs = num.checked_mul(mult).ok_or_else(|| {
        Error::InvalidConfig(format!("{}: Duration {:?} is too large", name, s))
    })?;
    Ok(Duration::from_secs(secs))
}

fn parse_duration(name: &str, fragment: &yaml::Yaml) -> Result<Option<Duration>, Error> {
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::Integer(i) if *i >= 0 => Ok(Some(Duration::from_secs(*i as u64))),
        yaml::Yaml::String(s) => Ok(Some(str_duration(name, s)?)),
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected duration, got '{:?}'",
            name, e
        ))),
    }
}

fn parse_array<T, F>(name: &str, fragment: &yaml::Yaml, parser: F) -> Result<Option<Vec<T>>, Error>
where
    F: Fn(&str, &yaml::Yaml) -> Result<Option<T>, Error>,
{
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::Array(a) => {
            let mut v = Vec::with_capacity(a.len());
            for item in a {
                match parser(name, item)? {
                    Some(x) => v.push(x),
                    None => {
                        return Err(Error::InvalidConfig(format!(
                            "{}: Unexpected null in array",
                            name
                        )))
                    }
                }
            }
            Ok(Some(v))
        }
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected array, got '{:?}'",
            name, e
        ))),
    }
}

fn parse_dns_server(name: &str, fragment: &yaml::Yaml) -> Result<Option<SocketAddrV4>, Error> {
    match parse_string(name, fragment)? {
        None => Ok(None),
        Some(s) => {
            if let Ok(sa) = s.parse::<SocketAddrV4>() {
                Ok(Some(sa))
            } else {
                let ip = s.parse::<Ipv4Addr>().map_err(|e| {
                    Error::InvalidConfig(format!("{}: Invalid IPv4 server {:?}: {}", name, s, e))
                })?;
                Ok(Some(SocketAddrV4::new(ip, DEFAULT_DNS_PORT)))
            }
        }
    }
}

fn parse_forwarder(name: &str, fragment: &yaml::Yaml) -> Result<Option<ForwarderConfig>, Error> {
    match fragment {
        yaml::Yaml::Null => Ok(None),
        yaml::Yaml::Hash(h) => {
            let mut ret = ForwarderConfig::default();
            for (k, v) in h {
                match k.as_str() {
                    Some("max-sockets") => {
                        if let Some(n) = parse_number("max-sockets", v)? {
                            if n < 1 {
                                return Err(Error::InvalidConfig(format!(
                                    "{}: max-sockets must be positive, not {}",
                                    name, n
                                )));
                            }
                            ret.max_sockets = n as usize;
                        }
                    }
                    Some("timeout") => {
                        if let Some(d) = parse_duration("timeout", v)? {
                            ret.timeout = d;
                        }
                    }
                    Some(opt) => {
                        return Err(Error::InvalidConfig(format!(
                            "Unknown {} keyword {}",
                            name, opt
                        )))
                    }
                    None => {
                        return Err(Error::InvalidConfig(format!(
                            "Expected string in {}, not {:?}",
                            name, k
                        )))
                    }
                }
            }
            Ok(Some(ret))
        }
        e => Err(Error::InvalidConfig(format!(
            "{}: Expected hash, got '{:?}'",
            name, e
        ))),
    }
}

fn parse_config(fragment: &yaml::Yaml) -> Result<Config, Error> {
    let h = fragment
        .as_hash()
        .ok_or_else(|| Error::InvalidConfig("Top level configuration should be a hash".into()))?;
    let mut servers = None;
    let mut answer = AnswerMode::default();
    let mut cname_blocking = false;
    let mut powersave = false;
    let mut allow = vec![];
    let mut deny = vec![];
    let mut forwarder = ForwarderConfig::default();

    for (k, v) in h {
        match k.as_str() {
            Some("dns-servers") => servers = parse_array("dns-servers", v, parse_dns_server)?,
            Some("answer") => {
                if let Some(a) = parse_string("answer", v)? {
                    answer = a.parse().map_err(Error::InvalidConfig)?;
                }
            }
            Some("cname-blocking") => {
                cname_blocking = parse_boolean("cname-blocking", v)?.unwrap_or(false)
            }
            Some("powersave") => powersave = parse_boolean("powersave", v)?.unwrap_or(false),
            Some("allow") => allow = parse_array("allow", v, parse_string)?.unwrap_or_default(),
            Some("deny") => deny = parse_array("deny", v, parse_string)?.unwrap_or_default(),
            Some("forwarder") => {
                forwarder = parse_forwarder("forwarder", v)
                    .map_err(|e| e.annotate("Failed to parse forwarder"))?
                    .unwrap_or_default()
            }
            Some(opt) => {
                return Err(Error::InvalidConfig(format!(
                    "Unknown configuration keyword {}",
                    opt
                )))
            }
            None => {
                return Err(Error::InvalidConfig(format!(
                    "Expected string key, not {:?}",
                    k
                )))
            }
        }
    }

    let dns_servers = servers.unwrap_or_default();
    if dns_servers.is_empty() || dns_servers.len() > MAX_DNS_SERVERS {
        return Err(Error::InvalidConfig(format!(
            "dns-servers: Expected 1 to {} servers, got {}",
            MAX_DNS_SERVERS,
            dns_servers.len()
        )));
    }

    for (i, server) in dns_servers.iter().enumerate() {
        if dns_servers[..i].contains(server) {
            return Err(Error::InvalidConfig(format!(
                "dns-servers: {} is listed more than once",
                server
            )));
        }
    }

    Ok(Config {
        settings: Settings {
            dns_servers,
            answer,
            cname_blocking,
            powersave,
        },
        allow,
        deny,
        forwarder,
    })
}

pub fn load_config_from_string(cfg: &str) -> Result<Config, Error> {
    let y = YamlLoader::load_from_str(cfg).map_err(Error::YamlError)?;
    match y.len() {
        0 => return Err(Error::MissingConfig),
        1 => (),
        _ => return Err(Error::MultipleConfigs),
    }
    parse_config(&y[0])
}

/* We support reading configs from a yaml file, _or_ a program (eg a shell script?) that outputs
 * yaml on stdout.
 */
pub fn load_config_from_path(path: &std::path::Path) -> Result<Config, Error> {
    let metadata = std::fs::metadata(path).map_err(Error::IoError)?;
    let configdata = if metadata.permissions().mode() & 0o111 != 0 {
        let output = std::process::Command::new(path)
            .output()
            .map_err(Error::IoError)?;
        if !output.status.success() {
            return Err(Error::ConfigProcessFailed);
        }
        String::from_utf8(output.stdout).map_err(Error::Utf8Error)?
    } else {
        let contents = std::fs::read(path).map_err(Error::IoError)?;
        String::from_utf8(contents).map_err(Error::Utf8Error)?
    };

    load_config_from_string(&configdata)
}

#[test]
fn test_config_parse() -> Result<(), Error> {
    let cfg = load_config_from_string(
        "---
dns-servers: ['192.0.2.53', '198.51.100.1:5353']
answer: sinkhole
cname-blocking: true
powersave: true
allow: [good.example.com]
deny: [ads.example.com, tracker.example.net]
forwarder:
    max-sockets: 64
    timeout: 5s
",
    )?;
    let settings = cfg.settings();
    assert_eq!(
        settings.dns_servers,
        vec![
            "192.0.2.53:53".parse().unwrap(),
            "198.51.100.1:5353".parse().unwrap()
        ]
    );
    assert_eq!(settings.answer, AnswerMode::Sinkhole);
    assert!(settings.cname_blocking);
    assert!(settings.powersave);
    assert_eq!(cfg.allow, vec!["good.example.com".to_string()]);
    assert_eq!(cfg.deny.len(), 2);
    assert_eq!(
        cfg.forwarder,
        ForwarderConfig {
            max_sockets: 64,
            timeout: Duration::from_secs(5)
        }
    );
    Ok(())
}

#[test]
fn test_config_defaults() -> Result<(), Error> {
    let cfg = load_config_from_string("dns-servers: [192.0.2.53]")?;
    assert_eq!(cfg.settings, Settings::new(vec!["192.0.2.53:53".parse().unwrap()]));
    assert_eq!(cfg.forwarder, ForwarderConfig::default());
    assert!(cfg.allow.is_empty());
    Ok(())
}

#[test]
fn test_config_errors() {
    assert!(matches!(
        load_config_from_string(""),
        Err(Error::MissingConfig)
    ));
    assert!(matches!(
        load_config_from_string("answer: classic"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: [192.0.2.1, 192.0.2.2, 192.0.2.3]"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: ['2001:db8::1']"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: [192.0.2.1]\nanswer: nxdomain"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: [192.0.2.1]\nbogus: 1"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: [192.0.2.1]\nforwarder: {timeout: 3d}"),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        load_config_from_string("dns-servers: ['192.0.2.1', '192.0.2.1:53']"),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_durations() {
    assert_eq!(str_duration("t", "90").unwrap(), Duration::from_secs(90));
    assert_eq!(str_duration("t", "2m").unwrap(), Duration::from_secs(120));
    assert_eq!(str_duration("t", "1h").unwrap(), Duration::from_secs(3600));
    assert_eq!(str_duration("t", "250ms").unwrap(), Duration::from_millis(250));
    assert!(str_duration("t", "x").is_err());
    assert!(str_duration("t", "99999999999999999h").is_err());
    assert!(matches!(
        load_config_from_string(
            "dns-servers: [192.0.2.1]\nforwarder: {timeout: 99999999999999999h}"
        ),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_config_servers_on_one_address() -> Result<(), Error> {
    let cfg = load_config_from_string("dns-servers: ['127.0.0.1:5353', '127.0.0.1:5354']")?;
    assert_eq!(cfg.settings.dns_servers.len(), 2);
    assert_ne!(cfg.settings.dns_servers[0], cfg.settings.dns_servers[1]);
    Ok(())
}
