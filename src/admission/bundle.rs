//! Bundle construction: the uncompressed tar archive stored in the Secret
//! Store, containing the user's upload followed by the credential envelope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Direct,
    Proxy,
    ProxyStatic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyJson {
    pub openai_token: String,
    pub key_mode: KeyMode,
    pub provider: String,
}

/// Builds the bundle tar bytes: `upload.zip` entry first, then `key.json`.
/// Order is part of the external contract (worker reads entries
/// sequentially) even though both are named, so it is fixed deterministically
/// here rather than left to iteration order.
pub fn build_bundle(upload_zip: &[u8], key: &KeyJson) -> std::io::Result<Vec<u8>> {
    let key_bytes = serde_json::to_vec(key).expect("KeyJson always serializes");

    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);

        let mut header = tar::Header::new_gnu();
        header.set_size(upload_zip.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, "upload.zip", upload_zip)?;

        let mut header = tar::Header::new_gnu();
        header.set_size(key_bytes.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, "key.json", key_bytes.as_slice())?;

        builder.finish()?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_entries_are_upload_then_key_in_order() {
        let key = KeyJson { openai_token: "tok".into(), key_mode: KeyMode::Direct, provider: "openai".into() };
        let bundle = build_bundle(b"zipbytes", &key).unwrap();
        let mut archive = tar::Archive::new(bundle.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["upload.zip", "key.json"]);
    }

    #[test]
    fn key_json_round_trips() {
        let key = KeyJson { openai_token: "STATIC".into(), key_mode: KeyMode::ProxyStatic, provider: "openai".into() };
        let json = serde_json::to_string(&key).unwrap();
        let parsed: KeyJson = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.openai_token, "STATIC");
        assert_eq!(parsed.key_mode, KeyMode::ProxyStatic);
    }
}
