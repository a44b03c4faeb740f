//! Resolving a client address to the per-subnet topology file that covers it.
//!
//! Files are named `ytopologies-<network-address>-<prefix-length>[-<sequence>].json` and live in
//! one directory per export date. Files whose name does not follow the convention are
//! identified by the `subnet` field of their contents instead.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{self, ErrorKind},
    net::IpAddr,
    path::{Path, PathBuf},
};

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const FILE_PREFIX: &str = "ytopologies-";
pub const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid client address {0:?}")]
    InvalidAddress(String),

    #[error("cannot scan topology directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyFileName {
    pub subnet: IpNet,
    pub sequence: Option<String>,
}

impl TopologyFileName {
    pub fn new(subnet: IpNet) -> Self {
        TopologyFileName {
            subnet: subnet.trunc(),
            sequence: None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        let mut parts = stem.splitn(3, '-');

        let addr = parts.next()?.parse::<IpAddr>().ok()?;
        let prefix_len = parts.next()?.parse::<u8>().ok()?;
        let subnet = IpNet::new(addr, prefix_len).ok()?;
        let sequence = parts.next().map(str::to_string);

        Some(TopologyFileName {
            subnet: subnet.trunc(),
            sequence,
        })
    }
}

impl fmt::Display for TopologyFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}-{}",
            FILE_PREFIX,
            self.subnet.addr(),
            self.subnet.prefix_len()
        )?;
        if let Some(sequence) = &self.sequence {
            write!(f, "-{}", sequence)?;
        }
        f.write_str(FILE_SUFFIX)
    }
}

/// Directory holding the files exported on `date` (`YYYY-MM-DD`).
pub fn topology_dir(root: impl AsRef<Path>, date: &str) -> PathBuf {
    root.as_ref().join(date)
}

/// Parses a client address. IPv4-mapped IPv6 addresses are treated as the IPv4 address they
/// carry, so a client can never match subnets of both families.
pub fn parse_client_ip(client_ip: &str) -> Result<IpAddr, LookupError> {
    client_ip
        .trim()
        .parse::<IpAddr>()
        .map(|addr| addr.to_canonical())
        .map_err(|_| LookupError::InvalidAddress(client_ip.to_string()))
}

#[derive(Deserialize)]
struct SubnetOnly {
    subnet: IpNet,
}

fn subnet_of_file(path: &Path) -> Option<IpNet> {
    let name = path.file_name()?.to_str()?;
    if let Some(parsed) = TopologyFileName::parse(name) {
        return Some(parsed.subnet);
    }
    if !name.ends_with(FILE_SUFFIX) {
        return None;
    }

    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(?path, %err, "skipping unreadable topology file");
            return None;
        }
    };
    match serde_json::from_slice::<SubnetOnly>(&contents) {
        Ok(only) => Some(only.subnet.trunc()),
        Err(err) => {
            debug!(?path, %err, "file does not name a subnet");
            None
        }
    }
}

/// Returns the topology file in `dir` whose subnet contains `client_ip`.
///
/// The most specific subnet wins when several match; equal prefixes are broken by path order.
/// A missing directory is treated as an empty one.
pub fn lookup(client_ip: &str, dir: impl AsRef<Path>) -> Result<Option<PathBuf>, LookupError> {
    let dir = dir.as_ref();
    let addr = parse_client_ip(client_ip)?;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(?dir, "no topology directory");
            return Ok(None);
        }
        Err(source) => {
            return Err(LookupError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut best: Option<(u8, PathBuf)> = None;
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                warn!(?dir, %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }

        let subnet = match subnet_of_file(&path) {
            Some(subnet) if subnet.contains(&addr) => subnet,
            _ => continue,
        };

        let better = match &best {
            None => true,
            Some((len, current)) => {
                subnet.prefix_len() > *len || (subnet.prefix_len() == *len && path < *current)
            }
        };
        if better {
            best = Some((subnet.prefix_len(), path));
        }
    }

    let found = best.map(|(_, path)| path);
    debug!(client = %addr, ?found, "subnet lookup");
    Ok(found)
}

/// Indexes object-storage keys of the form `<prefix>/<date>/ytopologies-…json` by subnet.
pub fn index_object_keys<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    date: &str,
) -> BTreeMap<IpNet, String> {
    let segment = format!("/{}", date);

    keys.into_iter()
        .filter_map(|key| {
            let (dir, name) = key.rsplit_once('/')?;
            if dir != date && !dir.ends_with(&segment) {
                return None;
            }
            let parsed = TopologyFileName::parse(name)?;
            Some((parsed.subnet, key.to_string()))
        })
        .collect()
}
