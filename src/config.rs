//! Ambient configuration surface (§6, §10): a line-oriented `key = value`
//! file overlaid with CLI flags. Deliberately not a full settings
//! framework -- just enough structure for the core's contract.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Merged view of the config file and CLI overrides, immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
    pub dagdev: String,
    pub monitorid: u16,
    pub mcastport: u16,
    pub mcastaddr: Ipv4Addr,
    pub srcaddr: Ipv4Addr,
    pub mtu: u16,
    pub filterfile: Option<PathBuf>,
    pub darknetoctet: i32,
    pub statinterval: u64,
    pub statdir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dagdev: "/dev/dag0".to_string(),
            monitorid: 1,
            mcastport: 9001,
            mcastaddr: Ipv4Addr::new(225, 0, 0, 225),
            srcaddr: Ipv4Addr::new(0, 0, 0, 0),
            mtu: 1400,
            filterfile: None,
            darknetoctet: -1,
            statinterval: 0,
            statdir: None,
        }
    }
}

impl Config {
    /// Parses a `key = value` file, applying documented defaults for any
    /// key that is absent. Blank lines and `#`-prefixed lines are ignored.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigInvalid {
            reason: format!("failed to read {}: {}", path.as_ref().display(), e),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::ConfigInvalid {
                reason: format!("line {}: expected `key = value`", lineno + 1),
            })?;
            let key = key.trim();
            let value = value.trim();
            cfg.apply(key, value)
                .map_err(|reason| Error::ConfigInvalid {
                    reason: format!("line {}: {}", lineno + 1, reason),
                })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        match key {
            "dagdev" => self.dagdev = value.to_string(),
            "monitorid" => self.monitorid = value.parse().map_err(|e| format!("{}", e))?,
            "mcastport" => self.mcastport = value.parse().map_err(|e| format!("{}", e))?,
            "mcastaddr" => self.mcastaddr = value.parse().map_err(|e| format!("{}", e))?,
            "srcaddr" => self.srcaddr = value.parse().map_err(|e| format!("{}", e))?,
            "mtu" => self.mtu = value.parse().map_err(|e| format!("{}", e))?,
            "filterfile" => self.filterfile = Some(PathBuf::from(value)),
            "darknetoctet" => self.darknetoctet = value.parse().map_err(|e| format!("{}", e))?,
            "statinterval" => self.statinterval = value.parse().map_err(|e| format!("{}", e))?,
            "statdir" => self.statdir = Some(PathBuf::from(value)),
            other => return Err(format!("unrecognised config key `{}`", other)),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.monitorid == 0 {
            return Err(Error::ConfigInvalid {
                reason: "0 is not a valid monitor ID -- choose another number".to_string(),
            });
        }
        Ok(())
    }

    /// Overlays parsed CLI flags on top of the config-file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = &cli.device {
            self.dagdev = v.clone();
        }
        if let Some(v) = cli.monitorid {
            self.monitorid = v;
        }
        if let Some(v) = cli.beaconport {
            self.mcastport = v;
        }
        if let Some(v) = cli.groupaddr {
            self.mcastaddr = v;
        }
        if let Some(v) = cli.sourceaddr {
            self.srcaddr = v;
        }
        if let Some(v) = cli.mtu {
            self.mtu = v;
        }
        if let Some(v) = &cli.excludefile {
            self.filterfile = Some(v.clone());
        }
        if let Some(v) = cli.firstoctet {
            self.darknetoctet = v;
        }
        if let Some(v) = cli.loginterval {
            self.statinterval = v;
        }
    }
}

/// Parsed command-line flags. Every field is optional: `None` means "inherit
/// from the config file or built-in default" (§4.7).
#[derive(Debug, Default, Clone)]
pub struct Cli {
    pub configfile: Option<PathBuf>,
    pub device: Option<String>,
    pub monitorid: Option<u16>,
    pub beaconport: Option<u16>,
    pub groupaddr: Option<Ipv4Addr>,
    pub sourceaddr: Option<Ipv4Addr>,
    pub mtu: Option<u16>,
    pub excludefile: Option<PathBuf>,
    pub firstoctet: Option<i32>,
    pub loginterval: Option<u64>,
    pub help: bool,
}

pub const USAGE: &str = "Usage: telescope-multiplexer [config-file] [options]\n\
    \n\
    Options:\n\
    \x20 -d, --device <path>        capture device (default /dev/dag0)\n\
    \x20 -m, --monitorid <id>       16-bit publisher id (default 1)\n\
    \x20 -p, --beaconport <port>    beacon UDP port (default 9001)\n\
    \x20 -a, --groupaddr <addr>     multicast group address (default 225.0.0.225)\n\
    \x20 -s, --sourceaddr <addr>    source interface address (default 0.0.0.0)\n\
    \x20 -M, --mtu <bytes>          datagram ceiling (default 1400)\n\
    \x20 -E, --excludefile <path>   darknet exclusion list\n\
    \x20 -o, --firstoctet <octet>   required first octet of darknet IPs (-1 = unrestricted)\n\
    \x20 -l, --loginterval <secs>   seconds between stats dumps (0 = off)\n\
    \x20 -h, --help                 print this message\n";

/// Parses argv (excluding argv[0]) into a [`Cli`]. Returns `Err` with a
/// human-readable reason on a malformed flag; the caller exits 1 in that
/// case and 0 after printing `--help`.
pub fn parse_cli<I: IntoIterator<Item = String>>(args: I) -> std::result::Result<Cli, String> {
    let mut cli = Cli::default();
    let mut iter = args.into_iter().peekable();

    fn take_value(
        flag: &str,
        iter: &mut std::iter::Peekable<impl Iterator<Item = String>>,
    ) -> std::result::Result<String, String> {
        iter.next()
            .ok_or_else(|| format!("{} requires a value", flag))
    }

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                cli.help = true;
            }
            "-d" | "--device" => cli.device = Some(take_value(&arg, &mut iter)?),
            "-m" | "--monitorid" => {
                cli.monitorid = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--monitorid: {}", e))?,
                )
            }
            "-p" | "--beaconport" => {
                cli.beaconport = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--beaconport: {}", e))?,
                )
            }
            "-a" | "--groupaddr" => {
                cli.groupaddr = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--groupaddr: {}", e))?,
                )
            }
            "-s" | "--sourceaddr" => {
                cli.sourceaddr = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--sourceaddr: {}", e))?,
                )
            }
            "-M" | "--mtu" => {
                cli.mtu = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--mtu: {}", e))?,
                )
            }
            "-E" | "--excludefile" => {
                cli.excludefile = Some(PathBuf::from(take_value(&arg, &mut iter)?))
            }
            "-o" | "--firstoctet" => {
                cli.firstoctet = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--firstoctet: {}", e))?,
                )
            }
            "-l" | "--loginterval" => {
                cli.loginterval = Some(
                    take_value(&arg, &mut iter)?
                        .parse()
                        .map_err(|e| format!("--loginterval: {}", e))?,
                )
            }
            other if !other.starts_with('-') && cli.configfile.is_none() => {
                cli.configfile = Some(PathBuf::from(other));
            }
            other => return Err(format!("unrecognised option `{}`", other)),
        }
    }

    Ok(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_applied_for_empty_file() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.dagdev, "/dev/dag0");
        assert_eq!(cfg.monitorid, 1);
        assert_eq!(cfg.mcastport, 9001);
        assert_eq!(cfg.mcastaddr, Ipv4Addr::new(225, 0, 0, 225));
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.darknetoctet, -1);
        assert_eq!(cfg.statinterval, 0);
    }

    #[test]
    fn parses_overrides_and_ignores_comments() {
        let text = "\
            # a comment\n\
            \n\
            dagdev = /dev/dag1\n\
            monitorid = 42\n\
            mtu=1500\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.dagdev, "/dev/dag1");
        assert_eq!(cfg.monitorid, 42);
        assert_eq!(cfg.mtu, 1500);
    }

    #[test]
    fn rejects_malformed_integer() {
        let err = Config::parse("monitorid = not-a-number\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn rejects_zero_monitor_id() {
        let err = Config::parse("monitorid = 0\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn cli_overrides_config() {
        let mut cfg = Config::parse("monitorid = 5\n").unwrap();
        let cli = parse_cli(vec!["--monitorid".to_string(), "9".to_string()]).unwrap();
        cfg.apply_cli(&cli);
        assert_eq!(cfg.monitorid, 9);
    }

    #[test]
    fn cli_rejects_unknown_flag() {
        assert!(parse_cli(vec!["--bogus".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_positional_config_path() {
        let cli = parse_cli(vec!["telescope.conf".to_string()]).unwrap();
        assert_eq!(cli.configfile, Some(PathBuf::from("telescope.conf")));
    }
}
