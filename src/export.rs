//! Turning the raw query export into per-subnet record files.

use std::{
    fs,
    io::{self, BufRead, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use ipnet::IpNet;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::lookup::TopologyFileName;

/// Status lines the query tool interleaves with its JSON output.
pub const QUERY_LOG_MARKERS: [&str; 3] = [
    "Created measurement-lab",
    "Number of affected rows",
    "Replaced measurement-lab",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot process export: {0}")]
    Io(#[from] io::Error),

    #[error("malformed export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Copies `reader` to `writer` without the query tool's status lines.
///
/// A status line that also opened the result array is replaced by a bare `[`, and the first
/// line of the form `,[…` loses its leading comma, so the concatenated result sets form a single
/// JSON array of arrays.
pub fn strip_query_log(reader: impl Read, writer: impl Write) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(writer);
    let mut first_comma_removed = false;

    for line in io::BufReader::new(reader).lines() {
        let line = line?;

        if QUERY_LOG_MARKERS.iter().any(|marker| line.contains(marker)) {
            if line.trim_start().starts_with('[') {
                writeln!(writer, "[")?;
            }
            continue;
        }

        match line.strip_prefix(',') {
            Some(rest) if !first_comma_removed && rest.starts_with('[') => {
                writeln!(writer, "{}", rest)?;
                first_comma_removed = true;
            }
            _ => writeln!(writer, "{}", line)?,
        }
    }

    writer.flush()?;
    Ok(())
}

/// Writes every record object of the cleaned export to its own file under `dir`, named after
/// its subnet. Objects are written as found, explicit nulls included; objects without a
/// parseable `subnet` are skipped.
pub fn split_by_subnet(
    export: impl Read,
    dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>, ExportError> {
    let dir = dir.as_ref();
    let batches: Vec<Vec<Value>> = serde_json::from_reader(io::BufReader::new(export))?;
    fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for item in batches.iter().flatten() {
        let subnet = match item
            .get("subnet")
            .and_then(Value::as_str)
            .and_then(|subnet| subnet.parse::<IpNet>().ok())
        {
            Some(subnet) => subnet,
            None => {
                debug!("skipping export item without subnet");
                continue;
            }
        };

        let path = dir.join(TopologyFileName::new(subnet).to_string());
        let mut out = BufWriter::new(fs::File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, item)?;
        out.flush()?;
        written.push(path);
    }

    info!(?dir, files = written.len(), "split export by subnet");
    Ok(written)
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::{lookup::lookup, record::ClientSubnetRecord};

    #[test]
    fn test_strip_query_log() {
        let raw = "Replaced measurement-lab.wehe.ytopologies\n\
                   [Created measurement-lab.wehe.tmp\n\
                   ,[{\"subnet\": \"10.1.0.0/16\"}]\n\
                   ,[{\"subnet\": \"10.2.0.0/16\"}]\n\
                   Number of affected rows: 3\n\
                   ]\n";
        let mut out = Vec::new();

        strip_query_log(raw.as_bytes(), &mut out).unwrap();

        let cleaned = String::from_utf8(out).unwrap();
        assert_eq!(
            cleaned,
            "[\n[{\"subnet\": \"10.1.0.0/16\"}]\n,[{\"subnet\": \"10.2.0.0/16\"}]\n]\n"
        );
        let batches: Vec<Vec<Value>> = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_split_by_subnet_preserves_nulls() {
        let dir = TempDir::new().unwrap();
        let export = r#"[
            [{"ASN": 45204, "ASName": "UNITEL LLC", "subnet": "37.110.208.0/21", "topos": []}],
            [{"ASN": 12389, "ASName": "ROSTELECOM", "subnet": "176.59.168.0/22", "topos": [
                {"leg1": {"hops": [{"hostname": null, "ip": "10.0.0.1", "asn": 1}]}, "leg2": {}}
            ]}, {"ASN": 1}]
        ]"#;

        let written = split_by_subnet(export.as_bytes(), dir.path()).unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(
            written[0].file_name().unwrap(),
            "ytopologies-37.110.208.0-21.json"
        );
        assert_eq!(
            lookup("176.59.168.2", dir.path()).unwrap().as_ref(),
            Some(&written[1])
        );

        let record = ClientSubnetRecord::from_path(&written[1]).unwrap();
        assert_eq!(
            record.absent_fields()[0],
            "topos[0].leg1.hops[0].hostname"
        );
    }

    #[test]
    fn test_split_rejects_malformed_export() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            split_by_subnet("{not json".as_bytes(), dir.path()),
            Err(ExportError::Json(_))
        ));
    }
}
