//! The emulator's on-disk object store.
//!
//! Layout per slot directory `<index>-<id>`:
//!
//! ```text
//! slot.info                 namedCurveSupported=<bool>
//! privkey/<hex-id>.info     key=value lines
//! privkey/<hex-id>.value    wrapped serialized private key
//! pubkey/<hex-id>.info      public-key material as properties
//! seckey/<hex-id>.info
//! seckey/<hex-id>.value     wrapped secret key bytes
//! ```
//!
//! All binary property values are lowercase hex.

use std::io::Write;

use camino::Utf8Path;
use camino::Utf8PathBuf;

pub const DIR_PRIVKEY: &str = "privkey";
pub const DIR_PUBKEY: &str = "pubkey";
pub const DIR_SECKEY: &str = "seckey";
pub const FILE_SLOT_INFO: &str = "slot.info";
pub const SUFFIX_INFO: &str = "info";
pub const SUFFIX_VALUE: &str = "value";

pub const PROP_ID: &str = "id";
pub const PROP_LABEL: &str = "label";
pub const PROP_KEYTYPE: &str = "keytype";
pub const PROP_ALGO: &str = "algo";
pub const PROP_ALGORITHM: &str = "algorithm";
pub const PROP_KEYSPEC: &str = "keyspec";
pub const PROP_SHA1: &str = "sha1";
pub const PROP_MODULUS: &str = "modus";
pub const PROP_PUBLIC_EXPONENT: &str = "publicExponent";
pub const PROP_PRIME: &str = "prime";
pub const PROP_SUBPRIME: &str = "subprime";
pub const PROP_BASE: &str = "base";
pub const PROP_VALUE: &str = "value";
pub const PROP_EC_PARAMS: &str = "ecParams";
pub const PROP_EC_POINT: &str = "ecPoint";
pub const PROP_NAMED_CURVE_SUPPORTED: &str = "namedCurveSupported";

/// An ordered `key=value` property list, the line format of `.info` files.
#[derive(Clone, Debug, Default)]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut props = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                props.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Self(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn set_hex(&mut self, key: &str, value: &[u8]) {
        self.set(key, hex::encode(value));
    }

    pub fn get_hex(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).and_then(|v| hex::decode(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.0 {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

pub fn read_properties(path: &Utf8Path) -> std::io::Result<Properties> {
    Ok(Properties::parse(&std::fs::read_to_string(path)?))
}

/// Writes a file through a tempfile in the same directory, so readers never
/// observe a half-written object file.
pub fn write_file(path: &Utf8Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("no parent directory for {path}")))?;
    let mut tempfile = tempfile::NamedTempFile::new_in(dir)?;
    tempfile.write_all(content)?;
    tempfile.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub fn object_path(slot_dir: &Utf8Path, object_dir: &str, hex_id: &str, suffix: &str) -> Utf8PathBuf {
    slot_dir.join(object_dir).join(format!("{hex_id}.{suffix}"))
}

/// Hex ids of every object in one of the three object directories, taken
/// from the `.info` file names.
pub fn list_hex_ids(slot_dir: &Utf8Path, object_dir: &str) -> std::io::Result<Vec<String>> {
    let dir = slot_dir.join(object_dir);
    let mut ids = Vec::new();
    if !dir.as_std_path().is_dir() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir.as_std_path())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(&format!(".{SUFFIX_INFO}")) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_round_trip() {
        let mut props = Properties::new();
        props.set(PROP_ID, "ab01");
        props.set(PROP_LABEL, "rsa-a");
        props.set_hex(PROP_MODULUS, &[0xCA, 0xFE]);

        let parsed = Properties::parse(&props.render());
        assert_eq!(parsed.get(PROP_ID), Some("ab01"));
        assert_eq!(parsed.get(PROP_LABEL), Some("rsa-a"));
        assert_eq!(parsed.get_hex(PROP_MODULUS), Some(vec![0xCA, 0xFE]));
    }

    #[test]
    fn parse_skips_comments_and_garbage() {
        let props = Properties::parse("# header\n\nid=01\nnot a property\nlabel = spaced \n");
        assert_eq!(props.get("id"), Some("01"));
        assert_eq!(props.get("label"), Some("spaced"));
        assert_eq!(props.iter().count(), 2);
    }
}
