// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line configuration. A hand-rolled
//! long-option parser — no CLI-parsing crate appears anywhere in this
//! project's lineage, so this mirrors the size and shape the rest of the
//! codebase uses for option parsing.

use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Parsed startup configuration.
pub struct Config {
    /// Number of Worker threads (default 1).
    pub worker_count: usize,
    /// Size of the Manager's Job pool (default 255).
    pub max_connections: usize,
    /// Per-connection scratch buffer size, in bytes (default 1 MiB).
    pub per_transfer_buffer_bytes: usize,
    /// IPv4 bind address (default `0.0.0.0`).
    pub ipv4_bind_address: Ipv4Addr,
    /// IPv6 bind address (default `::`).
    pub ipv6_bind_address: Ipv6Addr,
    /// Whether to also bind the IPv6 address (default off).
    pub enable_ipv6: bool,
    /// Whether to stand up the TLS listener(s) (default off).
    pub enable_tls: bool,
    /// Plaintext HTTP port (default 8080).
    pub http_port: u16,
    /// TLS port (default 8443).
    pub https_port: u16,
    /// Document root files are served from (default `./www`).
    pub document_root: PathBuf,
    /// PEM certificate chain path (default `./fullchain.pem`).
    pub tls_certificate_path: PathBuf,
    /// PEM private key path (default `./privkey.pem`).
    pub tls_private_key_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: 1,
            max_connections: 255,
            per_transfer_buffer_bytes: 1024 * 1024,
            ipv4_bind_address: Ipv4Addr::new(0, 0, 0, 0),
            ipv6_bind_address: Ipv6Addr::UNSPECIFIED,
            enable_ipv6: false,
            enable_tls: false,
            http_port: 8080,
            https_port: 8443,
            document_root: PathBuf::from("./www"),
            tls_certificate_path: PathBuf::from("./fullchain.pem"),
            tls_private_key_path: PathBuf::from("./privkey.pem"),
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("worker_count", &self.worker_count)
            .field("max_connections", &self.max_connections)
            .field("per_transfer_buffer_bytes", &self.per_transfer_buffer_bytes)
            .field("ipv4_bind_address", &self.ipv4_bind_address)
            .field("ipv6_bind_address", &self.ipv6_bind_address)
            .field("enable_ipv6", &self.enable_ipv6)
            .field("enable_tls", &self.enable_tls)
            .field("http_port", &self.http_port)
            .field("https_port", &self.https_port)
            .field("document_root", &self.document_root)
            .field("tls_certificate_path", &self.tls_certificate_path)
            .field("tls_private_key_path", &self.tls_private_key_path)
            .finish()
    }
}

/// What `Config::from_args` decided to do with the arguments it was given.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Run the server with this configuration.
    Run(Config),
    /// `--help`/`-h` was passed; usage was requested, not a server run.
    Help,
}

impl Config {
    /// Parses long options out of `args` (typically `std::env::args().skip(1)`).
    /// Unknown flags and malformed values are rejected; `--help`/`-h` short-circuits to
    /// [`ParseOutcome::Help`].
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParseOutcome, ConfigError> {
        let mut config = Config::default();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(ParseOutcome::Help),
                "--worker-count" => config.worker_count = parse_value(&mut iter, "--worker-count")?,
                "--max-connections" => config.max_connections = parse_value(&mut iter, "--max-connections")?,
                "--per-transfer-buffer-bytes" => {
                    config.per_transfer_buffer_bytes = parse_value(&mut iter, "--per-transfer-buffer-bytes")?
                }
                "--ipv4-bind-address" => config.ipv4_bind_address = parse_value(&mut iter, "--ipv4-bind-address")?,
                "--ipv6-bind-address" => config.ipv6_bind_address = parse_value(&mut iter, "--ipv6-bind-address")?,
                "--enable-ipv6" => config.enable_ipv6 = true,
                "--enable-tls" => config.enable_tls = true,
                "--http-port" => config.http_port = parse_value(&mut iter, "--http-port")?,
                "--https-port" => config.https_port = parse_value(&mut iter, "--https-port")?,
                "--document-root" => config.document_root = PathBuf::from(next_value(&mut iter, "--document-root")?),
                "--tls-certificate-path" => {
                    config.tls_certificate_path = PathBuf::from(next_value(&mut iter, "--tls-certificate-path")?)
                }
                "--tls-private-key-path" => {
                    config.tls_private_key_path = PathBuf::from(next_value(&mut iter, "--tls-private-key-path")?)
                }
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
        }

        if config.max_connections == 0 {
            return Err(ConfigError::ImpossibleCapacity);
        }

        Ok(ParseOutcome::Run(config))
    }
}

fn next_value<I: Iterator<Item = String>>(iter: &mut I, flag: &'static str) -> Result<String, ConfigError> {
    iter.next().ok_or(ConfigError::InvalidValue { flag, value: String::new() })
}

fn parse_value<I: Iterator<Item = String>, T: FromStr>(iter: &mut I, flag: &'static str) -> Result<T, ConfigError> {
    let raw = next_value(iter, flag)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue { flag, value: raw })
}

/// Usage text printed to stderr on `--help`/`-h` or a rejected argument.
pub const USAGE: &str = "\
Usage: raskd [OPTIONS]

Options:
      --worker-count <N>                Number of worker threads [default: 1]
      --max-connections <N>             Maximum concurrent connections [default: 255]
      --per-transfer-buffer-bytes <N>   Per-connection scratch buffer size [default: 1048576]
      --ipv4-bind-address <ADDR>        IPv4 address to bind [default: 0.0.0.0]
      --ipv6-bind-address <ADDR>        IPv6 address to bind [default: ::]
      --enable-ipv6                     Also bind the IPv6 address
      --enable-tls                      Also stand up the HTTPS listener(s)
      --http-port <PORT>                Plaintext HTTP port [default: 8080]
      --https-port <PORT>               TLS port [default: 8443]
      --document-root <PATH>            Directory to serve files from [default: ./www]
      --tls-certificate-path <PATH>     PEM certificate chain [default: ./fullchain.pem]
      --tls-private-key-path <PATH>     PEM private key [default: ./privkey.pem]
  -h, --help                            Print this message and exit
";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(1, config.worker_count);
        assert_eq!(255, config.max_connections);
        assert_eq!(1024 * 1024, config.per_transfer_buffer_bytes);
        assert_eq!(Ipv4Addr::new(0, 0, 0, 0), config.ipv4_bind_address);
        assert_eq!(Ipv6Addr::UNSPECIFIED, config.ipv6_bind_address);
        assert!(!config.enable_ipv6);
        assert!(!config.enable_tls);
        assert_eq!(8080, config.http_port);
        assert_eq!(8443, config.https_port);
    }

    #[test]
    fn parses_recognized_long_options() {
        let args = vec![
            "--worker-count".to_string(),
            "4".to_string(),
            "--enable-tls".to_string(),
            "--https-port".to_string(),
            "9443".to_string(),
        ];
        match Config::from_args(args).unwrap() {
            ParseOutcome::Run(config) => {
                assert_eq!(4, config.worker_count);
                assert!(config.enable_tls);
                assert_eq!(9443, config.https_port);
            }
            ParseOutcome::Help => panic!("expected Run"),
        }
    }

    #[test]
    fn help_flag_short_circuits() {
        assert!(matches!(Config::from_args(["--help".to_string()]).unwrap(), ParseOutcome::Help));
        assert!(matches!(Config::from_args(["-h".to_string()]).unwrap(), ParseOutcome::Help));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let result = Config::from_args(["--bogus".to_string()]);
        assert!(matches!(result, Err(ConfigError::UnknownFlag(flag)) if flag == "--bogus"));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let args = vec!["--worker-count".to_string(), "not-a-number".to_string()];
        let result = Config::from_args(args);
        assert!(matches!(result, Err(ConfigError::InvalidValue { flag: "--worker-count", .. })));
    }

    #[test]
    fn zero_max_connections_is_impossible_capacity() {
        let args = vec!["--max-connections".to_string(), "0".to_string()];
        assert!(matches!(Config::from_args(args), Err(ConfigError::ImpossibleCapacity)));
    }
}
