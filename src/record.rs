//! Per-subnet topology records as exported by the Y-topology query.
//!
//! Hop and endpoint fields are [`Slot`]s rather than `Option`s: an exported hop can carry an
//! explicit `null` or lack the key entirely, and both make a candidate incomplete. Neither case
//! is ever replaced by a default value.

use std::{
    fmt, fs,
    io::{self, Read},
    net::IpAddr,
    path::Path,
};

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cannot read topology record: {0}")]
    Io(#[from] io::Error),

    #[error("malformed topology record: {0}")]
    Json(#[from] serde_json::Error),
}

/// A JSON field that is either absent, explicitly `null`, or carries a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot<T> {
    Missing,
    Null,
    Value(T),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Missing
    }
}

impl<T> Slot<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Slot::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Slot::Null)
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Slot::Value(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<T> for Slot<T> {
    fn from(value: T) -> Self {
        Slot::Value(value)
    }
}

// Only reached for keys that are present; absent keys fall back to `Default`.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Slot<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Slot::Value(value),
            None => Slot::Null,
        })
    }
}

impl<T: Serialize> Serialize for Slot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Slot::Value(value) => value.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }
}

/// One traceroute hop. Endpoint servers use the same shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub hostname: Slot<String>,
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub ip: Slot<IpAddr>,
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub asn: Slot<u32>,
}

impl Hop {
    fn absent_fields(&self, path: &str, out: &mut Vec<String>) {
        let slots = [
            ("hostname", self.hostname.is_present()),
            ("ip", self.ip.is_present()),
            ("asn", self.asn.is_present()),
        ];
        for (field, present) in slots {
            if !present {
                out.push(format!("{}.{}", path, field));
            }
        }
    }
}

/// One path of a Y: the hops from the client towards `server`, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub hops: Slot<Vec<Hop>>,
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub server: Slot<Hop>,
}

impl Leg {
    pub fn hops(&self) -> &[Hop] {
        self.hops.value().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn server(&self) -> Option<&Hop> {
        self.server.value()
    }

    /// The endpoint's AS, or the last hop with a known AS when the endpoint has none.
    pub fn terminal_asn(&self) -> Option<u32> {
        self.server()
            .and_then(|server| server.asn.value())
            .or_else(|| self.hops().iter().rev().find_map(|hop| hop.asn.value()))
            .copied()
    }

    /// The hops followed by the endpoint.
    pub fn walk(&self) -> impl Iterator<Item = &Hop> {
        self.hops().iter().chain(self.server())
    }

    fn absent_fields(&self, path: &str, out: &mut Vec<String>) {
        match &self.hops {
            Slot::Value(hops) => {
                for (i, hop) in hops.iter().enumerate() {
                    hop.absent_fields(&format!("{}.hops[{}]", path, i), out);
                }
            }
            _ => out.push(format!("{}.hops", path)),
        }
        match &self.server {
            Slot::Value(server) => server.absent_fields(&format!("{}.server", path), out),
            _ => out.push(format!("{}.server", path)),
        }
    }
}

/// A stored Y-topology candidate (`topo` in the export). Either leg may itself be null or
/// missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyCandidate {
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub leg1: Slot<Leg>,
    #[serde(default, skip_serializing_if = "Slot::is_missing")]
    pub leg2: Slot<Leg>,
}

impl TopologyCandidate {
    pub fn new(leg1: Leg, leg2: Leg) -> Self {
        TopologyCandidate {
            leg1: leg1.into(),
            leg2: leg2.into(),
        }
    }

    pub fn legs(&self) -> Option<(&Leg, &Leg)> {
        Some((self.leg1.value()?, self.leg2.value()?))
    }

    /// Paths of every field that is null or missing, e.g. `leg2.hops[1].asn`.
    pub fn absent_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, leg) in [("leg1", &self.leg1), ("leg2", &self.leg2)] {
            match leg {
                Slot::Value(leg) => leg.absent_fields(name, &mut out),
                _ => out.push(name.to_string()),
            }
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.absent_fields().is_empty()
    }

    pub fn endpoints(&self) -> Option<(&Hop, &Hop)> {
        let (leg1, leg2) = self.legs()?;
        Some((leg1.server()?, leg2.server()?))
    }

    /// Both endpoints carry an address and the addresses differ.
    pub fn has_distinct_endpoints(&self) -> bool {
        match self.endpoints() {
            Some((a, b)) => match (a.ip.value(), b.ip.value()) {
                (Some(ip_a), Some(ip_b)) => ip_a != ip_b,
                _ => false,
            },
            None => false,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.is_complete() && self.has_distinct_endpoints()
    }
}

/// Client identity handed to revalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "ASN")]
    pub asn: u32,
    #[serde(rename = "ASName")]
    pub as_name: String,
    pub subnet: IpNet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSubnetRecord {
    #[serde(rename = "ASN")]
    pub asn: u32,
    #[serde(rename = "ASName")]
    pub as_name: String,
    pub subnet: IpNet,
    #[serde(default)]
    pub topos: Vec<TopologyCandidate>,
}

impl ClientSubnetRecord {
    pub fn from_reader(reader: impl Read) -> Result<Self, RecordError> {
        Ok(serde_json::from_reader(io::BufReader::new(reader))?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        ClientSubnetRecord::from_reader(fs::File::open(path)?)
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            asn: self.asn,
            as_name: self.as_name.clone(),
            subnet: self.subnet,
        }
    }

    /// Completeness scan over every candidate, reporting paths like `topos[3].leg1.server.ip`.
    pub fn absent_fields(&self) -> Vec<String> {
        self.topos
            .iter()
            .enumerate()
            .flat_map(|(i, topo)| {
                topo.absent_fields()
                    .into_iter()
                    .map(move |field| format!("topos[{}].{}", i, field))
            })
            .collect()
    }
}

impl fmt::Display for ClientSubnetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS{} ({}) {}", self.asn, self.as_name, self.subnet)
    }
}

/// Paths of every explicit `null` in an arbitrary JSON document, for records that do not fit
/// the typed schema.
pub fn find_absent(value: &Value) -> Vec<String> {
    fn walk(value: &Value, path: String, out: &mut Vec<String>) {
        match value {
            Value::Null => out.push(if path.is_empty() {
                "<root>".to_string()
            } else {
                path
            }),
            Value::Object(map) => {
                for (key, item) in map {
                    let sub = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };
                    walk(item, sub, out);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, format!("{}[{}]", path, i), out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(value, String::new(), &mut out);
    out
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn hop(hostname: &str, ip: &str, asn: u32) -> Hop {
        Hop {
            hostname: hostname.to_string().into(),
            ip: ip.parse::<IpAddr>().unwrap().into(),
            asn: asn.into(),
        }
    }

    #[test]
    fn test_null_and_missing_are_distinct() {
        let parsed: Hop =
            serde_json::from_value(json!({"hostname": null, "ip": "10.0.0.1"})).unwrap();

        assert!(parsed.hostname.is_null());
        assert_eq!(parsed.ip.value(), Some(&"10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(parsed.asn.is_missing());

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back, json!({"hostname": null, "ip": "10.0.0.1"}));
    }

    #[test]
    fn test_absent_fields_reports_paths() {
        let topo = TopologyCandidate::new(
            Leg {
                hops: vec![hop("gw", "10.0.0.1", 64500), Hop::default()].into(),
                server: hop("del02", "61.246.223.40", 9498).into(),
            },
            Leg {
                hops: Slot::Null,
                server: Slot::Missing,
            },
        );

        assert_eq!(
            topo.absent_fields(),
            vec![
                "leg1.hops[1].hostname",
                "leg1.hops[1].ip",
                "leg1.hops[1].asn",
                "leg2.hops",
                "leg2.server",
            ]
        );
        assert!(!topo.is_complete());
        assert!(!topo.is_well_formed());
    }

    #[test]
    fn test_distinct_endpoints() {
        let leg = |ip: &str| Leg {
            hops: vec![].into(),
            server: hop("del02", ip, 9498).into(),
        };
        let same = TopologyCandidate::new(leg("61.246.223.40"), leg("61.246.223.40"));
        assert!(same.is_complete());
        assert!(!same.is_well_formed());

        let distinct = TopologyCandidate::new(leg("61.246.223.40"), leg("61.246.223.14"));
        assert!(distinct.is_well_formed());
    }

    #[test]
    fn test_terminal_asn_falls_back_to_hops() {
        let leg = Leg {
            hops: vec![hop("a", "10.0.0.1", 1), hop("b", "10.0.0.2", 2)].into(),
            server: Hop {
                asn: Slot::Null,
                ..hop("srv", "10.0.0.3", 0)
            }
            .into(),
        };
        assert_eq!(leg.terminal_asn(), Some(2));
        assert_eq!(leg.walk().count(), 3);
    }

    #[test]
    fn test_find_absent_on_raw_json() {
        let doc = json!({
            "ASN": 1,
            "topos": [{"leg1": {"hops": [{"asn": null}]}}],
            "ASName": null
        });

        let mut found = find_absent(&doc);
        found.sort();
        assert_eq!(found, vec!["ASName", "topos[0].leg1.hops[0].asn"]);
        assert_eq!(find_absent(&Value::Null), vec!["<root>"]);
        assert!(find_absent(&json!({"a": [1, "x"]})).is_empty());
    }

    #[test]
    fn test_null_or_missing_leg_is_incomplete() {
        let server = |hostname: &str, ip: &str| json!({"hostname": hostname, "ip": ip, "asn": 9498});
        let raw = json!({
            "ASN": 45204,
            "ASName": "UNITEL LLC",
            "subnet": "37.110.208.0/21",
            "topos": [
                {
                    "leg1": {"hops": [], "server": server("del02", "61.246.223.40")},
                    "leg2": {"hops": [], "server": server("del04", "49.45.151.104")}
                },
                {
                    "leg1": {"hops": [], "server": server("del02", "61.246.223.40")},
                    "leg2": null
                },
                {
                    "leg1": {"hops": [], "server": server("del02", "61.246.223.40")}
                }
            ]
        });

        let record = ClientSubnetRecord::from_reader(raw.to_string().as_bytes()).unwrap();

        assert_eq!(record.topos.len(), 3);
        assert!(record.topos[0].is_well_formed());
        assert!(record.topos[1].leg2.is_null());
        assert!(record.topos[2].leg2.is_missing());
        assert_eq!(record.absent_fields(), vec!["topos[1].leg2", "topos[2].leg2"]);
        assert!(!record.topos[1].is_well_formed());
        assert_eq!(record.topos[2].legs(), None);
        assert_eq!(record.topos[2].endpoints(), None);
    }

    #[test]
    fn test_record_requires_subnet() {
        let err = ClientSubnetRecord::from_reader(r#"{"ASN": 1, "ASName": "x"}"#.as_bytes());
        assert!(matches!(err, Err(RecordError::Json(_))));
    }
}
