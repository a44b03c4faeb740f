//! Extraction of the server pairs a record offers for differential tests.

use std::{collections::BTreeSet, net::IpAddr};

use tracing::debug;

use crate::record::ClientSubnetRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pair<T> {
    pub a: T,
    pub b: T,
    pub network: String,
}

/// Pairs in first-seen order. `(a, b)` and `(b, a)` for the same network count as one pair;
/// the orientation seen first is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSet<T> {
    pairs: Vec<Pair<T>>,
    seen: BTreeSet<(T, T, String)>,
}

impl<T> Default for PairSet<T> {
    fn default() -> Self {
        PairSet {
            pairs: Vec::new(),
            seen: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> PairSet<T> {
    pub fn insert(&mut self, a: T, b: T, network: &str) -> bool {
        let key = if a <= b {
            (a.clone(), b.clone(), network.to_string())
        } else {
            (b.clone(), a.clone(), network.to_string())
        };
        if !self.seen.insert(key) {
            return false;
        }

        self.pairs.push(Pair {
            a,
            b,
            network: network.to_string(),
        });
        true
    }

    /// Exact match, orientation included.
    pub fn contains<Q>(&self, a: &Q, b: &Q, network: &str) -> bool
    where
        T: PartialEq<Q>,
        Q: ?Sized,
    {
        self.pairs
            .iter()
            .any(|pair| pair.a == *a && pair.b == *b && pair.network == network)
    }

    pub fn contains_either_way<Q>(&self, a: &Q, b: &Q, network: &str) -> bool
    where
        T: PartialEq<Q>,
        Q: ?Sized,
    {
        self.contains(a, b, network) || self.contains(b, a, network)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair<T>> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPairs {
    pub servers: PairSet<String>,
    pub ips: PairSet<IpAddr>,
}

/// Endpoint hostnames and addresses of every well-formed candidate, tagged with the record's
/// network name. Incomplete candidates and candidates whose endpoints coincide are skipped.
pub fn compute_server_pairs(record: &ClientSubnetRecord) -> ServerPairs {
    let mut pairs = ServerPairs::default();

    for (i, topo) in record.topos.iter().enumerate() {
        if !topo.is_well_formed() {
            debug!(subnet = %record.subnet, candidate = i, "skipping incomplete candidate");
            continue;
        }
        let (a, b) = match topo.endpoints() {
            Some(endpoints) => endpoints,
            None => continue,
        };

        if let (Some(host_a), Some(host_b)) = (a.hostname.value(), b.hostname.value()) {
            pairs
                .servers
                .insert(host_a.clone(), host_b.clone(), &record.as_name);
        }
        if let (Some(ip_a), Some(ip_b)) = (a.ip.value(), b.ip.value()) {
            pairs.ips.insert(*ip_a, *ip_b, &record.as_name);
        }
    }

    pairs
}
