//! AS-level relationship graphs built from CAIDA-style datasets, and the memoized upstream
//! resolver the revalidation engine queries.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    io::{self, BufRead},
    num::ParseIntError,
    sync::{Arc, PoisonError, RwLock},
};

use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::{EdgeRef, VisitMap, Visitable},
    Direction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::IpVersion;

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum RelType {
    CustomerToProvider,
    PeerToPeer,
    ProviderToCustomer,
    Sibling,
}

/// How sibling edges take part in the upstream closure.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingPolicy {
    /// Siblings are walked as equivalent nodes: their providers join the closure, the siblings
    /// themselves do not.
    #[default]
    Expand,
    /// Sibling edges are not followed.
    Ignore,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read dataset: {0}")]
    Io(#[from] io::Error),

    #[error("invalid AS number in {line:?}: {source}")]
    ParseAsn {
        line: String,
        #[source]
        source: ParseIntError,
    },

    #[error("unknown relationship type {kind:?} in {line:?}")]
    UnknownRelationship { kind: String, line: String },

    #[error("malformed row {line:?}")]
    MalformedRow { line: String },

    #[error("invalid prefix in {line:?}: {source}")]
    InvalidPrefix {
        line: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

pub(crate) fn parse_asn(field: &str, line: &str) -> Result<u32, DatasetError> {
    field
        .trim()
        .parse::<u32>()
        .map_err(|source| DatasetError::ParseAsn {
            line: line.to_string(),
            source,
        })
}

/// Relationship graph of one protocol family. Edges keep the direction of the dataset row they
/// came from; the meaning of the direction is carried by [`RelType`].
#[derive(Debug, Default)]
pub struct AsGraph {
    pub graph: DiGraph<u32, RelType>,
    asn2index: HashMap<u32, NodeIndex>,
}

impl AsGraph {
    pub fn from_edges(edges: Vec<(u32, u32, RelType)>) -> Self {
        let mut topo = AsGraph::default();

        for (asn1, asn2, rel) in edges {
            let asn1 = topo.get_or_create(asn1);
            let asn2 = topo.get_or_create(asn2);
            topo.graph.add_edge(asn1, asn2, rel);
        }

        topo
    }

    /// Parses a CAIDA serial-1 style file: `asA|asB|rel[|source]`, `#` starts a comment line.
    ///
    /// `-1` means asA is a provider of asB, `0` peers, `1` asA is a customer of asB and `2`
    /// siblings.
    pub fn from_caida(reader: impl io::Read) -> Result<Self, DatasetError> {
        let mut edges = Vec::new();

        for line in io::BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = line.split('|').collect::<Vec<&str>>();
            if fields.len() < 3 {
                return Err(DatasetError::MalformedRow {
                    line: line.to_string(),
                });
            }
            let asn1 = parse_asn(fields[0], line)?;
            let asn2 = parse_asn(fields[1], line)?;

            let rel = match fields[2].trim() {
                "-1" => RelType::ProviderToCustomer,
                "0" => RelType::PeerToPeer,
                "1" => RelType::CustomerToProvider,
                "2" => RelType::Sibling,
                kind => {
                    return Err(DatasetError::UnknownRelationship {
                        kind: kind.to_string(),
                        line: line.to_string(),
                    })
                }
            };
            edges.push((asn1, asn2, rel));
        }

        Ok(AsGraph::from_edges(edges))
    }

    fn get_or_create(&mut self, asn: u32) -> NodeIndex {
        let graph = &mut self.graph;
        *self
            .asn2index
            .entry(asn)
            .or_insert_with(|| graph.add_node(asn))
    }

    pub fn asn_of(&self, index: NodeIndex) -> u32 {
        self.graph[index]
    }

    pub fn index_of(&self, asn: u32) -> Option<NodeIndex> {
        self.asn2index.get(&asn).copied()
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.asn2index.contains_key(&asn)
    }

    pub fn all_asns(&self) -> HashSet<u32> {
        self.asn2index.keys().copied().collect()
    }

    fn related(
        &self,
        index: NodeIndex,
        incoming: RelType,
        outgoing: RelType,
    ) -> impl Iterator<Item = NodeIndex> + '_ {
        let from_incoming = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .filter(move |edge| *edge.weight() == incoming)
            .map(|edge| edge.source());

        let from_outgoing = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(move |edge| *edge.weight() == outgoing)
            .map(|edge| edge.target());

        from_incoming.chain(from_outgoing)
    }

    fn provider_indices(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.related(
            index,
            RelType::ProviderToCustomer,
            RelType::CustomerToProvider,
        )
    }

    fn sibling_indices(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.related(index, RelType::Sibling, RelType::Sibling)
    }

    pub fn providers_of(&self, asn: u32) -> Option<HashSet<u32>> {
        Some(
            self.provider_indices(self.index_of(asn)?)
                .map(|index| self.asn_of(index))
                .collect(),
        )
    }

    pub fn siblings_of(&self, asn: u32) -> Option<HashSet<u32>> {
        Some(
            self.sibling_indices(self.index_of(asn)?)
                .map(|index| self.asn_of(index))
                .collect(),
        )
    }

    /*
     * Walks customer -> provider edges starting at `asn` and collects every provider met on the
     * way. The walk uses an explicit stack over node indices and a visit map, so a provider
     * cycle (two ASes marked as each other's provider) is entered once and never loops.
     *
     *        ┌─────┐
     *        │  1  │
     *        └──┬──┘
     *        ┌──▼──┐     ┌─────┐
     *        │  2  ◄─────►  5  │   sibling
     *        └──┬──┘     └─────┘
     *        ┌──▼──┐
     *        │  3  │  upstreams(3) = {1, 2}, plus the providers of 5 under Expand
     *        └─────┘
     *
     * The starting AS is never part of its own closure.
     */
    pub fn upstream_closure(&self, asn: u32, policy: SiblingPolicy) -> BTreeSet<u32> {
        let mut upstreams = BTreeSet::new();
        let start = match self.index_of(asn) {
            Some(index) => index,
            None => return upstreams,
        };

        let mut visited = self.graph.visit_map();
        visited.visit(start);
        let mut stack = vec![start];

        while let Some(index) = stack.pop() {
            for provider in self.provider_indices(index) {
                upstreams.insert(self.asn_of(provider));
                if visited.visit(provider) {
                    stack.push(provider);
                }
            }

            if policy == SiblingPolicy::Expand {
                for sibling in self.sibling_indices(index) {
                    if visited.visit(sibling) {
                        stack.push(sibling);
                    }
                }
            }
        }

        upstreams.remove(&asn);
        upstreams
    }
}

/// Upstream sets per `(asn, ip version)`, computed on first use and kept for the lifetime of the
/// resolver. Both graphs are immutable after construction, so a resolver can be shared by
/// reference across worker threads.
#[derive(Debug)]
pub struct UpstreamResolver {
    v4: AsGraph,
    v6: AsGraph,
    policy: SiblingPolicy,
    cache: RwLock<HashMap<(u32, IpVersion), Arc<BTreeSet<u32>>>>,
}

impl UpstreamResolver {
    pub fn new(v4: AsGraph, v6: AsGraph, policy: SiblingPolicy) -> Self {
        UpstreamResolver {
            v4,
            v6,
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SiblingPolicy {
        self.policy
    }

    pub fn graph(&self, version: IpVersion) -> &AsGraph {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }

    /// Whether the relationship data of `version` mentions `asn` at all.
    pub fn knows(&self, asn: u32, version: IpVersion) -> bool {
        self.graph(version).contains(asn)
    }

    pub fn upstreams_of(&self, asn: u32, version: IpVersion) -> Arc<BTreeSet<u32>> {
        let key = (asn, version);
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(hit);
        }

        let upstreams = Arc::new(self.graph(version).upstream_closure(asn, self.policy));
        debug!(asn, ?version, count = upstreams.len(), "computed upstream set");

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(key).or_insert(upstreams))
    }

    /// Siblings of `asn` that the closure treats as equivalent nodes; empty under
    /// [`SiblingPolicy::Ignore`].
    pub fn siblings_of(&self, asn: u32, version: IpVersion) -> BTreeSet<u32> {
        match self.policy {
            SiblingPolicy::Ignore => BTreeSet::new(),
            SiblingPolicy::Expand => self
                .graph(version)
                .siblings_of(asn)
                .map(|siblings| siblings.into_iter().collect())
                .unwrap_or_default(),
        }
    }
}
