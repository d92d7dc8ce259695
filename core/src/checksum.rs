use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }
}

/// Expected digest, given in a file's extra parameters as
/// `{"checksum": {"type": "sha256", "hex": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRequest {
    #[serde(rename = "type")]
    pub checksum_type: ChecksumType,
    pub hex: String,
}

impl ChecksumRequest {
    pub fn from_extra(extra: Option<&Value>) -> CoreResult<Option<Self>> {
        let Some(value) = extra.and_then(|extra| extra.get("checksum")) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| CoreError::Config(format!("checksum parameter: {}", err)))
    }
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> CoreResult<()> {
    let actual = match req.checksum_type {
        ChecksumType::Md5 => digest_file::<Md5>(path)?,
        ChecksumType::Sha1 => digest_file::<Sha1>(path)?,
        ChecksumType::Sha256 => digest_file::<Sha256>(path)?,
    };
    if actual.eq_ignore_ascii_case(req.hex.trim()) {
        Ok(())
    } else {
        Err(CoreError::Transfer(format!(
            "{} mismatch for {}: expected {}, got {}",
            req.checksum_type.as_str(),
            path.display(),
            req.hex,
            actual
        )))
    }
}

fn digest_file<D: Digest>(path: &Path) -> CoreResult<String> {
    let file = File::open(path).map_err(|err| CoreError::Io(err.to_string()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verifies_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.jpg");
        std::fs::write(&path, b"abc").unwrap();

        let sha = ChecksumRequest {
            checksum_type: ChecksumType::Sha256,
            hex: "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".to_string(),
        };
        verify_checksum(&path, &sha).unwrap();

        let md5 = ChecksumRequest {
            checksum_type: ChecksumType::Md5,
            hex: "0000".to_string(),
        };
        assert!(matches!(verify_checksum(&path, &md5), Err(CoreError::Transfer(_))));
    }

    #[test]
    fn parses_request_from_extra() {
        let extra = json!({"checksum": {"type": "sha1", "hex": "a9993e364706816aba3e25717850c26c9cd0d89d"}});
        let req = ChecksumRequest::from_extra(Some(&extra)).unwrap().unwrap();
        assert_eq!(req.checksum_type, ChecksumType::Sha1);
        assert!(ChecksumRequest::from_extra(None).unwrap().is_none());
        assert!(ChecksumRequest::from_extra(Some(&json!({"checksum": 3}))).is_err());
    }
}
