//! Revalidation of stored Y-topology candidates against current AS-relationship and IXP data.
//!
//! A candidate is kept only when the reference data affirmatively shows that its two legs leave
//! the client through different upstream providers, stay apart afterwards and do not meet at an
//! exchange point. Whenever the data cannot show this the candidate is dropped.

use std::{
    collections::BTreeSet,
    fmt, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    context::ReferenceData,
    ixp::IxpIndex,
    lookup::FILE_SUFFIX,
    record::{ClientInfo, ClientSubnetRecord, Hop, Leg, RecordError, TopologyCandidate},
    relationships::UpstreamResolver,
    IpVersion,
};

/// Why a candidate failed revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Incomplete,
    SameEndpoint,
    NoIxpData,
    UnknownAs(u32),
    NoClientUpstreams,
    UnresolvedLeg,
    SameEgress(u32),
    EgressNotUpstream(u32),
    SharedTransit(u32, u32),
    PathsOverlap(u32),
    IxpJunction(u32, u32),
    IxpFabric(IpAddr),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Incomplete => write!(f, "candidate has absent fields"),
            Rejection::SameEndpoint => write!(f, "endpoints are not distinct"),
            Rejection::NoIxpData => write!(f, "no IXP data loaded"),
            Rejection::UnknownAs(asn) => write!(f, "AS{} missing from relationship data", asn),
            Rejection::NoClientUpstreams => write!(f, "client has no known upstreams"),
            Rejection::UnresolvedLeg => write!(f, "a leg has no AS past the client"),
            Rejection::SameEgress(asn) => write!(f, "both legs leave through AS{}", asn),
            Rejection::EgressNotUpstream(asn) => {
                write!(f, "AS{} is no longer an upstream of the client", asn)
            }
            Rejection::SharedTransit(a, b) => {
                write!(f, "AS{} and AS{} are upstream of each other", a, b)
            }
            Rejection::PathsOverlap(asn) => write!(f, "both legs cross AS{}", asn),
            Rejection::IxpJunction(a, b) => write!(f, "AS{} and AS{} meet at an IXP", a, b),
            Rejection::IxpFabric(addr) => write!(f, "legs diverge on IXP fabric at {}", addr),
        }
    }
}

struct LegSummary<'a> {
    egress: u32,
    egress_hop: &'a Hop,
    terminal: u32,
    asns: BTreeSet<u32>,
}

impl<'a> LegSummary<'a> {
    /// `local` holds the client AS and the ASes treated as equivalent to it.
    fn resolve(leg: &'a Leg, local: &BTreeSet<u32>) -> Result<Self, Rejection> {
        let (egress, egress_hop) = leg
            .walk()
            .find_map(|hop| match hop.asn.value() {
                Some(asn) if !local.contains(asn) => Some((*asn, hop)),
                _ => None,
            })
            .ok_or(Rejection::UnresolvedLeg)?;
        let terminal = leg.terminal_asn().ok_or(Rejection::UnresolvedLeg)?;
        let asns = leg.walk().filter_map(|hop| hop.asn.value().copied()).collect();

        Ok(LegSummary {
            egress,
            egress_hop,
            terminal,
            asns,
        })
    }
}

/// Like [`recheck_topology`], but reports why a candidate is dropped.
pub fn check_topology(
    topo: &TopologyCandidate,
    as_upstreams: &UpstreamResolver,
    ixps: &IxpIndex,
    client: &ClientInfo,
) -> Result<(), Rejection> {
    if !topo.is_complete() {
        return Err(Rejection::Incomplete);
    }
    if !topo.has_distinct_endpoints() {
        return Err(Rejection::SameEndpoint);
    }
    if ixps.is_empty() {
        return Err(Rejection::NoIxpData);
    }

    let version = IpVersion::from(&client.subnet);
    if !as_upstreams.knows(client.asn, version) {
        return Err(Rejection::UnknownAs(client.asn));
    }
    let client_upstreams = as_upstreams.upstreams_of(client.asn, version);
    if client_upstreams.is_empty() {
        return Err(Rejection::NoClientUpstreams);
    }

    let (leg1, leg2) = topo.legs().ok_or(Rejection::Incomplete)?;
    let mut local = as_upstreams.siblings_of(client.asn, version);
    local.insert(client.asn);
    let a = LegSummary::resolve(leg1, &local)?;
    let b = LegSummary::resolve(leg2, &local)?;

    for leg in [&a, &b] {
        for asn in [leg.egress, leg.terminal] {
            if !as_upstreams.knows(asn, version) {
                return Err(Rejection::UnknownAs(asn));
            }
        }
    }
    if a.egress == b.egress {
        return Err(Rejection::SameEgress(a.egress));
    }
    for leg in [&a, &b] {
        if !client_upstreams.contains(&leg.egress) {
            return Err(Rejection::EgressNotUpstream(leg.egress));
        }
    }

    let mutual_upstreams = |x: u32, y: u32| {
        as_upstreams.upstreams_of(x, version).contains(&y)
            && as_upstreams.upstreams_of(y, version).contains(&x)
    };
    for (x, y) in [(a.terminal, b.terminal), (a.egress, b.egress)] {
        if mutual_upstreams(x, y) {
            return Err(Rejection::SharedTransit(x, y));
        }
    }
    if b.asns.contains(&a.egress) {
        return Err(Rejection::PathsOverlap(a.egress));
    }
    if a.asns.contains(&b.egress) {
        return Err(Rejection::PathsOverlap(b.egress));
    }

    if ixps.share_exchange(a.terminal, b.terminal) {
        return Err(Rejection::IxpJunction(a.terminal, b.terminal));
    }
    for leg in [&a, &b] {
        if let Some(addr) = leg.egress_hop.ip.value() {
            if !ixps.exchanges_for(*addr).is_empty() {
                return Err(Rejection::IxpFabric(*addr));
            }
        }
    }

    Ok(())
}

/// Decides whether a stored candidate is still a valid Y-topology. Never fails: missing or
/// inconclusive reference data yields `false`.
pub fn recheck_topology(
    topo: &TopologyCandidate,
    as_upstreams: &UpstreamResolver,
    ixps: &IxpIndex,
    client: &ClientInfo,
) -> bool {
    match check_topology(topo, as_upstreams, ixps, client) {
        Ok(()) => true,
        Err(reason) => {
            debug!(subnet = %client.subnet, asn = client.asn, %reason, "dropping candidate");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecheckOutcome {
    pub kept: usize,
    pub dropped: usize,
}

impl RecheckOutcome {
    /// Records without any remaining candidate are no longer served.
    pub fn is_servable(&self) -> bool {
        self.kept > 0
    }
}

/// Drops every candidate of `record` that fails revalidation.
pub fn retain_valid(record: &mut ClientSubnetRecord, data: &ReferenceData) -> RecheckOutcome {
    let client = record.client_info();
    let before = record.topos.len();
    record.topos.retain(|topo| data.recheck(topo, &client));

    let outcome = RecheckOutcome {
        kept: record.topos.len(),
        dropped: before - record.topos.len(),
    };
    if !outcome.is_servable() {
        debug!(%record, "no candidate survived revalidation");
    }
    outcome
}

/// Revalidates independent records in parallel.
pub fn revalidate_records(
    records: &mut [ClientSubnetRecord],
    data: &ReferenceData,
) -> Vec<RecheckOutcome> {
    records
        .par_iter_mut()
        .map(|record| retain_valid(record, data))
        .collect()
}

#[derive(Debug)]
pub struct RecheckedFile {
    pub path: PathBuf,
    pub result: Result<(ClientSubnetRecord, RecheckOutcome), RecordError>,
}

/// Loads and revalidates every record file in `dir`, one worker task per file. A file that
/// cannot be read or parsed is reported in its own entry and does not affect the others.
pub fn revalidate_directory(
    dir: impl AsRef<Path>,
    data: &ReferenceData,
) -> Result<Vec<RecheckedFile>, RecordError> {
    let dir = dir.as_ref();
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.to_string_lossy().ends_with(FILE_SUFFIX) {
            paths.push(path);
        }
    }
    paths.sort();

    let results: Vec<RecheckedFile> = paths
        .into_par_iter()
        .map(|path| {
            let result = ClientSubnetRecord::from_path(&path).map(|mut record| {
                let outcome = retain_valid(&mut record, data);
                (record, outcome)
            });
            if let Err(err) = &result {
                warn!(?path, %err, "skipping record");
            }
            RecheckedFile { path, result }
        })
        .collect();

    let servable = results
        .iter()
        .filter(|file| matches!(&file.result, Ok((_, outcome)) if outcome.is_servable()))
        .count();
    info!(?dir, files = results.len(), servable, "revalidated topology records");

    Ok(results)
}
