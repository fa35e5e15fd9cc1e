//! Darknet filter (C3): a per-record keep/drop predicate over the record's
//! IPv4 destination, plus the exclusion-list reader (A6).

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// Outcome of applying a filter to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop,
}

/// A record predicate. Implementations never block and report classification
/// failures as `Err` (fatal to the worker per §4.3/§7); a record that simply
/// isn't IPv4 is not an error -- it is dropped.
pub trait RecordFilter: Send + Sync {
    /// `record` is the full record body, header already stripped by the
    /// walker.
    fn apply(&self, record: &[u8]) -> std::result::Result<Decision, String>;
}

/// The no-op filter: keeps every record. Used to prove filter idempotence
/// (§8 property 6) and as the "filtering disabled" default.
pub struct KeepAll;

impl RecordFilter for KeepAll {
    fn apply(&self, _record: &[u8]) -> std::result::Result<Decision, String> {
        Ok(Decision::Keep)
    }
}

/// Keeps records whose IPv4 destination lands in the configured darknet: an
/// optional required first octet plus a set of excluded `/24` prefixes
/// loaded from a text file (§4.3, §6).
pub struct DarknetFilter {
    first_octet: Option<u8>,
    excluded_24s: HashSet<u32>,
}

impl DarknetFilter {
    pub fn new(first_octet: i32, excluded_24s: HashSet<u32>) -> Self {
        DarknetFilter {
            first_octet: if first_octet >= 0 {
                Some(first_octet as u8)
            } else {
                None
            },
            excluded_24s,
        }
    }

    /// Loads the `/24` exclusion list named by `path` (§6): one dotted-quad
    /// prefix per line, blank lines and `#`-comments ignored. A malformed
    /// line aborts the load entirely -- a half-loaded exclusion list would
    /// silently under-filter.
    pub fn load_exclusion_file(path: impl AsRef<Path>) -> Result<HashSet<u32>> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigInvalid {
            reason: format!(
                "failed to read exclusion file {}: {}",
                path.as_ref().display(),
                e
            ),
        })?;
        Self::parse_exclusion_list(&text)
    }

    pub fn parse_exclusion_list(text: &str) -> Result<HashSet<u32>> {
        let mut prefixes = HashSet::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let addr: Ipv4Addr = line.parse().map_err(|_| Error::ConfigInvalid {
                reason: format!(
                    "line {}: `{}` is not a dotted-quad prefix",
                    lineno + 1,
                    line
                ),
            })?;
            prefixes.insert(u32::from(addr) & 0xFFFF_FF00);
        }
        Ok(prefixes)
    }

    fn destination(record: &[u8]) -> Option<Ipv4Addr> {
        if record.len() < 20 {
            return None;
        }
        if record[0] >> 4 != 4 {
            // Not an IPv4 packet we can classify.
            return None;
        }
        Some(Ipv4Addr::new(
            record[16], record[17], record[18], record[19],
        ))
    }
}

impl RecordFilter for DarknetFilter {
    fn apply(&self, record: &[u8]) -> std::result::Result<Decision, String> {
        let dest = match Self::destination(record) {
            Some(d) => d,
            None => return Ok(Decision::Drop),
        };

        if let Some(octet) = self.first_octet {
            if dest.octets()[0] != octet {
                return Ok(Decision::Drop);
            }
        }

        let prefix = u32::from(dest) & 0xFFFF_FF00;
        if self.excluded_24s.contains(&prefix) {
            return Ok(Decision::Drop);
        }

        Ok(Decision::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ipv4_packet(dest: Ipv4Addr) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45; // version 4, IHL 5
        let d = dest.octets();
        buf[16..20].copy_from_slice(&d);
        buf
    }

    #[test]
    fn keep_all_always_keeps() {
        let filter = KeepAll;
        assert_eq!(filter.apply(&[1, 2, 3]).unwrap(), Decision::Keep);
    }

    #[test]
    fn non_ipv4_is_dropped_not_erred() {
        let filter = DarknetFilter::new(-1, HashSet::new());
        assert_eq!(filter.apply(&[0u8; 4]).unwrap(), Decision::Drop);
    }

    #[test]
    fn first_octet_constraint() {
        let filter = DarknetFilter::new(10, HashSet::new());
        let keep = ipv4_packet(Ipv4Addr::new(10, 0, 0, 1));
        let drop = ipv4_packet(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(filter.apply(&keep).unwrap(), Decision::Keep);
        assert_eq!(filter.apply(&drop).unwrap(), Decision::Drop);
    }

    #[test]
    fn exclusion_list_drops_matching_24() {
        let mut excluded = HashSet::new();
        excluded.insert(u32::from(Ipv4Addr::new(192, 0, 2, 0)));
        let filter = DarknetFilter::new(-1, excluded);
        let drop = ipv4_packet(Ipv4Addr::new(192, 0, 2, 55));
        let keep = ipv4_packet(Ipv4Addr::new(192, 0, 3, 55));
        assert_eq!(filter.apply(&drop).unwrap(), Decision::Drop);
        assert_eq!(filter.apply(&keep).unwrap(), Decision::Keep);
    }

    #[test]
    fn parses_exclusion_list_skipping_comments_and_blanks() {
        let text = "# header\n\n192.0.2.0\n203.0.113.0\n";
        let set = DarknetFilter::parse_exclusion_list(text).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&u32::from(Ipv4Addr::new(192, 0, 2, 0))));
    }

    #[test]
    fn rejects_malformed_exclusion_line() {
        let text = "not-an-ip\n";
        assert!(DarknetFilter::parse_exclusion_list(text).is_err());
    }
}
