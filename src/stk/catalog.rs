//! Volume catalog: the JSON object keyed by VSN that describes every
//! cartridge the library holds.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, RustStkError};

/// Longest volume serial number.
pub const MAX_VSN_LENGTH: usize = 6;

/// One catalog entry. Only `path` and `writeEnabled` drive library
/// behaviour; the rest is carried for the administrative surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeRecord {
    /// Image path relative to the tape library root.
    pub path: String,
    pub write_enabled: bool,
    pub tfsp_managed: bool,
    pub owner: Option<String>,
    pub physical_name: Option<String>,
    pub system_vsn: Option<String>,
    pub user_owned: bool,
    pub listable: bool,
    pub access: Option<String>,
    pub format: Option<String>,
    pub labeled: bool,
    pub read_only: bool,
}

pub type VolumeCatalog = BTreeMap<String, VolumeRecord>;

pub fn is_valid_vsn(vsn: &str) -> bool {
    !vsn.is_empty() && vsn.len() <= MAX_VSN_LENGTH && vsn.chars().all(|c| c.is_ascii_graphic())
}

/// Parse catalog JSON, dropping entries whose key is not a usable VSN.
pub fn parse_catalog(json: &str) -> Result<VolumeCatalog> {
    let raw: BTreeMap<String, VolumeRecord> = serde_json::from_str(json)?;
    let mut catalog = VolumeCatalog::new();
    for (vsn, record) in raw {
        if !is_valid_vsn(&vsn) {
            warn!("Ignoring catalog entry with invalid VSN {:?}", vsn);
            continue;
        }
        if record.path.is_empty() {
            warn!("Ignoring catalog entry {} without a path", vsn);
            continue;
        }
        catalog.insert(vsn, record);
    }
    Ok(catalog)
}

pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<VolumeCatalog> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|e| {
        RustStkError::catalog(format!("cannot read {}: {}", path.display(), e))
    })?;
    let catalog = parse_catalog(&json)?;
    info!("Loaded {} volumes from {}", catalog.len(), path.display());
    Ok(catalog)
}

pub fn to_json(catalog: &VolumeCatalog) -> Result<String> {
    Ok(serde_json::to_string_pretty(catalog)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "TAPE01": { "path": "tapes/tape01.img", "writeEnabled": false, "owner": "SYSTEM", "labeled": true },
        "SCR001": { "path": "tapes/scr001.img", "writeEnabled": true, "readOnly": false },
        "TOOLONG7": { "path": "tapes/x.img" },
        "NOPATH": { "writeEnabled": true }
    }"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = parse_catalog(SAMPLE).unwrap();
        assert_eq!(catalog.len(), 2);

        let tape01 = &catalog["TAPE01"];
        assert_eq!(tape01.path, "tapes/tape01.img");
        assert!(!tape01.write_enabled);
        assert_eq!(tape01.owner.as_deref(), Some("SYSTEM"));
        assert!(tape01.labeled);
        assert!(catalog["SCR001"].write_enabled);
    }

    #[test]
    fn test_load_catalog_and_json_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let catalog = load_catalog(file.path()).unwrap();
        let again = parse_catalog(&to_json(&catalog).unwrap()).unwrap();
        assert_eq!(again, catalog);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(parse_catalog("[1, 2]").is_err());
        assert!(load_catalog("/nonexistent/catalog.json").is_err());
    }

    #[test]
    fn test_vsn_validation() {
        assert!(is_valid_vsn("A"));
        assert!(is_valid_vsn("TAPE01"));
        assert!(!is_valid_vsn(""));
        assert!(!is_valid_vsn("TAPE001"));
        assert!(!is_valid_vsn("TA E1"));
    }
}
