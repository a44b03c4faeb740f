//! The read-only reference data a revalidation run consults, built once from the
//! AS-relationship and IXP datasets and then shared by all workers.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use bzip2::read::BzDecoder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ixp::IxpIndex,
    record::{ClientInfo, TopologyCandidate},
    recheck::recheck_topology,
    relationships::{AsGraph, DatasetError, SiblingPolicy, UpstreamResolver},
    IpVersion,
};

/// Where the reference datasets live and how to interpret them.
///
/// ```json
/// {
///   "as_rel_v4": "cache/20250501.as-rel.txt.bz2",
///   "as_rel_v6": "cache/20250501.as-rel.v6-stable.txt.bz2",
///   "ixps": "cache/ixps.txt",
///   "sibling_policy": "expand"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPaths {
    pub as_rel_v4: PathBuf,
    #[serde(default)]
    pub as_rel_v6: Option<PathBuf>,
    pub ixps: PathBuf,
    #[serde(default)]
    pub sibling_policy: SiblingPolicy,
}

impl DatasetPaths {
    pub fn from_json(reader: impl Read) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }
}

/// Opens a dataset file, decompressing it when the name ends in `.bz2`.
pub fn open_dataset(path: impl AsRef<Path>) -> io::Result<Box<dyn Read>> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);

    if path.extension().map_or(false, |ext| ext == "bz2") {
        Ok(Box::new(BzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

#[derive(Debug)]
pub struct ReferenceData {
    pub upstreams: UpstreamResolver,
    pub ixps: IxpIndex,
}

impl ReferenceData {
    pub fn new(upstreams: UpstreamResolver, ixps: IxpIndex) -> Self {
        ReferenceData { upstreams, ixps }
    }

    /// Loads every dataset named in `paths`. Without an IPv6 relationship file the IPv6 graph
    /// is empty, and IPv6 candidates then never revalidate.
    pub fn load(paths: &DatasetPaths) -> Result<Self, DatasetError> {
        let v4 = AsGraph::from_caida(open_dataset(&paths.as_rel_v4)?)?;
        let v6 = match &paths.as_rel_v6 {
            Some(path) => AsGraph::from_caida(open_dataset(path)?)?,
            None => AsGraph::default(),
        };
        let ixps = IxpIndex::from_rows(open_dataset(&paths.ixps)?)?;

        info!(
            v4_ases = v4.graph.node_count(),
            v4_edges = v4.graph.edge_count(),
            v6_ases = v6.graph.node_count(),
            v6_edges = v6.graph.edge_count(),
            ixps = ixps.len(),
            "loaded reference datasets"
        );

        Ok(ReferenceData::new(
            UpstreamResolver::new(v4, v6, paths.sibling_policy),
            ixps,
        ))
    }

    pub fn upstreams_of(&self, asn: u32, version: IpVersion) -> Arc<BTreeSet<u32>> {
        self.upstreams.upstreams_of(asn, version)
    }

    pub fn recheck(&self, topo: &TopologyCandidate, client: &ClientInfo) -> bool {
        recheck_topology(topo, &self.upstreams, &self.ixps, client)
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Write};

    use bzip2::{write::BzEncoder, Compression};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_plain_and_bz2_datasets() {
        let dir = TempDir::new().unwrap();

        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"# v4\n174|64500|-1\n").unwrap();
        fs::write(dir.path().join("as-rel.txt.bz2"), encoder.finish().unwrap()).unwrap();
        fs::write(dir.path().join("ixps.txt"), "AMS-IX|174|\n").unwrap();

        let config = format!(
            r#"{{"as_rel_v4": "{}", "ixps": "{}", "sibling_policy": "ignore"}}"#,
            dir.path().join("as-rel.txt.bz2").display(),
            dir.path().join("ixps.txt").display()
        );
        let paths = DatasetPaths::from_json(config.as_bytes()).unwrap();
        assert_eq!(paths.as_rel_v6, None);
        assert_eq!(paths.sibling_policy, SiblingPolicy::Ignore);

        let data = ReferenceData::load(&paths).unwrap();
        assert_eq!(*data.upstreams_of(64500, IpVersion::V4), [174].into());
        assert!(data.upstreams_of(64500, IpVersion::V6).is_empty());
        assert_eq!(data.ixps.len(), 1);
    }

    #[test]
    fn test_load_reports_missing_files() {
        let paths = DatasetPaths {
            as_rel_v4: PathBuf::from("/nonexistent/as-rel.txt"),
            as_rel_v6: None,
            ixps: PathBuf::from("/nonexistent/ixps.txt"),
            sibling_policy: SiblingPolicy::default(),
        };

        assert!(matches!(
            ReferenceData::load(&paths),
            Err(DatasetError::Io(_))
        ));
    }
}
