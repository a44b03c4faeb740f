//! Exchange-point membership, answering whether two networks meet at a common IXP.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io::{self, BufRead},
    net::IpAddr,
};

use ipnet::IpNet;

use crate::relationships::{parse_asn, DatasetError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IxpRecord {
    pub name: String,
    pub members: BTreeSet<u32>,
    pub prefixes: BTreeSet<IpNet>,
}

/// Something that can be located at an exchange: a member network or an address on a peering
/// LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Asn(u32),
    Addr(IpAddr),
}

impl From<u32> for Member {
    fn from(asn: u32) -> Self {
        Member::Asn(asn)
    }
}

impl From<IpAddr> for Member {
    fn from(addr: IpAddr) -> Self {
        Member::Addr(addr)
    }
}

#[derive(Debug, Default)]
pub struct IxpIndex {
    records: BTreeMap<String, IxpRecord>,
    by_asn: HashMap<u32, BTreeSet<String>>,
    prefixes: Vec<(IpNet, String)>,
}

impl IxpIndex {
    /// Builds the index; records sharing a name are merged.
    pub fn from_records(records: impl IntoIterator<Item = IxpRecord>) -> Self {
        let mut merged: BTreeMap<String, IxpRecord> = BTreeMap::new();
        for record in records {
            let entry = merged
                .entry(record.name.clone())
                .or_insert_with(|| IxpRecord {
                    name: record.name.clone(),
                    ..IxpRecord::default()
                });
            entry.members.extend(record.members);
            entry.prefixes.extend(record.prefixes);
        }

        let mut by_asn: HashMap<u32, BTreeSet<String>> = HashMap::new();
        let mut prefixes = Vec::new();
        for record in merged.values() {
            for asn in &record.members {
                by_asn
                    .entry(*asn)
                    .or_default()
                    .insert(record.name.clone());
            }
            for prefix in &record.prefixes {
                prefixes.push((prefix.trunc(), record.name.clone()));
            }
        }

        IxpIndex {
            records: merged,
            by_asn,
            prefixes,
        }
    }

    /// Parses `name|asn|prefix` rows. Either the AS number or the prefix may be left empty, so
    /// member lists and peering LANs can come from separate rows. `#` starts a comment line.
    pub fn from_rows(reader: impl io::Read) -> Result<Self, DatasetError> {
        let mut records: BTreeMap<String, IxpRecord> = BTreeMap::new();

        for line in io::BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = line.split('|').map(str::trim).collect::<Vec<&str>>();
            let (name, asn, prefix) = match fields.as_slice() {
                [name, asn, prefix] if !name.is_empty() => (*name, *asn, *prefix),
                _ => {
                    return Err(DatasetError::MalformedRow {
                        line: line.to_string(),
                    })
                }
            };
            if asn.is_empty() && prefix.is_empty() {
                return Err(DatasetError::MalformedRow {
                    line: line.to_string(),
                });
            }

            let record = records
                .entry(name.to_string())
                .or_insert_with(|| IxpRecord {
                    name: name.to_string(),
                    ..IxpRecord::default()
                });
            if !asn.is_empty() {
                record.members.insert(parse_asn(asn, line)?);
            }
            if !prefix.is_empty() {
                let prefix = prefix
                    .parse::<IpNet>()
                    .map_err(|source| DatasetError::InvalidPrefix {
                        line: line.to_string(),
                        source,
                    })?;
                record.prefixes.insert(prefix);
            }
        }

        Ok(IxpIndex::from_records(records.into_values()))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, name: &str) -> Option<&IxpRecord> {
        self.records.get(name)
    }

    pub fn shared_exchanges(&self, asn1: u32, asn2: u32) -> BTreeSet<&str> {
        match (self.by_asn.get(&asn1), self.by_asn.get(&asn2)) {
            (Some(left), Some(right)) => left.intersection(right).map(String::as_str).collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn share_exchange(&self, asn1: u32, asn2: u32) -> bool {
        !self.shared_exchanges(asn1, asn2).is_empty()
    }

    pub fn exchanges_for(&self, who: impl Into<Member>) -> BTreeSet<&str> {
        match who.into() {
            Member::Asn(asn) => self
                .by_asn
                .get(&asn)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect(),
            Member::Addr(addr) => self
                .prefixes
                .iter()
                .filter(|(prefix, _)| prefix.contains(&addr))
                .map(|(_, name)| name.as_str())
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ROWS: &str = r#"# name|asn|prefix
France-IX Paris|51207|2001:7f8:54::/64
France-IX Paris|5511|
France-IX Paris||37.49.236.0/22
DE-CIX Frankfurt|1299|2001:7f8::/64
DE-CIX Frankfurt|6453|
DE-CIX Frankfurt|8218|
France-IX Paris|8218|
"#;

    fn index() -> IxpIndex {
        IxpIndex::from_rows(ROWS.as_bytes()).unwrap()
    }

    #[test]
    fn test_from_rows_merges_by_name() {
        let ixps = index();

        assert_eq!(ixps.len(), 2);
        let france = ixps.record("France-IX Paris").unwrap();
        assert_eq!(france.members, [51207, 5511, 8218].into());
        assert_eq!(france.prefixes.len(), 2);
    }

    #[test]
    fn test_share_exchange() {
        let ixps = index();

        assert!(ixps.share_exchange(51207, 5511));
        assert!(ixps.share_exchange(6453, 1299));
        assert!(!ixps.share_exchange(5511, 6453));
        assert!(!ixps.share_exchange(5511, 424242));
        assert_eq!(
            ixps.shared_exchanges(8218, 5511),
            ["France-IX Paris"].into()
        );
    }

    #[test]
    fn test_exchanges_for_asn_and_address() {
        let ixps = index();

        assert_eq!(
            ixps.exchanges_for(8218u32),
            ["DE-CIX Frankfurt", "France-IX Paris"].into()
        );
        let on_lan: IpAddr = "2001:7f8:54::a505:1".parse().unwrap();
        assert_eq!(ixps.exchanges_for(on_lan), ["France-IX Paris"].into());
        let v4_on_lan: IpAddr = "37.49.237.12".parse().unwrap();
        assert_eq!(ixps.exchanges_for(v4_on_lan), ["France-IX Paris"].into());
        let elsewhere: IpAddr = "2a01:cfc4::1".parse().unwrap();
        assert!(ixps.exchanges_for(elsewhere).is_empty());
    }

    #[test]
    fn test_from_rows_rejects_bad_rows() {
        assert!(matches!(
            IxpIndex::from_rows("only|two".as_bytes()),
            Err(DatasetError::MalformedRow { .. })
        ));
        assert!(matches!(
            IxpIndex::from_rows("X||".as_bytes()),
            Err(DatasetError::MalformedRow { .. })
        ));
        assert!(matches!(
            IxpIndex::from_rows("X|1|not-a-prefix".as_bytes()),
            Err(DatasetError::InvalidPrefix { .. })
        ));
    }
}
