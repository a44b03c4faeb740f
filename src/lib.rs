//! ytopo pairs measurement servers into Y-topologies for a client subnet and keeps those pairs
//! honest over time: candidates stored at export time are re-checked against CAIDA-style
//! AS-relationship data and IXP membership data, and dropped once the two paths no longer
//! diverge at distinct upstream providers.
//!
//! ```no_run
//! use ytopo::{compute_server_pairs, lookup, ClientSubnetRecord, DatasetPaths, ReferenceData};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = DatasetPaths::from_json(std::fs::File::open("datasets.json")?)?;
//! let data = ReferenceData::load(&paths)?;
//!
//! if let Some(path) = lookup("37.110.210.2", "topos/2025-04-28")? {
//!     let mut record = ClientSubnetRecord::from_path(path)?;
//!     let pairs = compute_server_pairs(&record);
//!     println!("{} server pairs", pairs.servers.len());
//!
//!     ytopo::retain_valid(&mut record, &data);
//! }
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub mod context;
pub mod export;
pub mod ixp;
pub mod lookup;
pub mod pairs;
pub mod recheck;
pub mod record;
pub mod relationships;

pub use context::{open_dataset, DatasetPaths, ReferenceData};
pub use export::{split_by_subnet, strip_query_log, ExportError};
pub use ixp::{IxpIndex, IxpRecord, Member};
pub use lookup::{index_object_keys, lookup, topology_dir, LookupError, TopologyFileName};
pub use pairs::{compute_server_pairs, Pair, PairSet, ServerPairs};
pub use recheck::{
    check_topology, recheck_topology, retain_valid, revalidate_directory, revalidate_records,
    RecheckOutcome, RecheckedFile, Rejection,
};
pub use record::{
    find_absent, ClientInfo, ClientSubnetRecord, Hop, Leg, RecordError, Slot, TopologyCandidate,
};
pub use relationships::{AsGraph, DatasetError, RelType, SiblingPolicy, UpstreamResolver};

/// Protocol family. Relationship data is kept separately per family.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl From<IpAddr> for IpVersion {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl From<&IpNet> for IpVersion {
    fn from(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        }
    }
}
