/// Metadata header extraction.
///
/// Every deployable regular file starts with a delimited JSON header that
/// carries ownership, permissions, and the commands tied to the file. The
/// on-disk layout is `delimiter + json + delimiter + "\n" + body`; only the
/// body is deployed, and content hashes are computed over the body alone.
use crate::error::FatalError;
use crate::repo::Action;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Exact byte sequence opening and closing the JSON header.
pub const METADATA_DELIMITER: &str = "#|^^^|#";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileMetadata {
    #[serde(rename = "FileOwnerGroup")]
    pub owner_group: String,

    /// Octal mode carried as its decimal-digit form, e.g. `644`.
    #[serde(rename = "FilePermissions")]
    pub permissions: u32,

    #[serde(rename = "ReloadCommands", default, skip_serializing_if = "Vec::is_empty")]
    pub reload_commands: Vec<String>,

    #[serde(rename = "CheckCommands", default, skip_serializing_if = "Vec::is_empty")]
    pub check_commands: Vec<String>,

    #[serde(rename = "InstallCommands", default, skip_serializing_if = "Vec::is_empty")]
    pub install_commands: Vec<String>,

    #[serde(rename = "ExternalContentLocation", default, skip_serializing_if = "Option::is_none")]
    pub external_content_location: Option<String>,

    /// Legacy flag; a non-empty reload list is authoritative.
    #[serde(rename = "ReloadRequired", default, skip_serializing_if = "Option::is_none")]
    pub reload_required: Option<bool>,
}

/// Everything the executor needs to know about one planned file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub action: Action,
    /// Post-header body; empty for deletes and symlinks.
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`.
    pub hash: String,
    pub metadata: FileMetadata,
}

impl FileInfo {
    pub fn without_content(action: Action) -> FileInfo {
        FileInfo {
            action,
            content: Vec::new(),
            hash: String::new(),
            metadata: FileMetadata::default(),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Splits a raw file into its metadata header and body.
pub fn extract(path: &str, raw: &[u8]) -> Result<(FileMetadata, Vec<u8>), FatalError> {
    let parse_err = |reason: &str| FatalError::MetadataParse {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let delim = METADATA_DELIMITER.as_bytes();
    let after_start = raw
        .strip_prefix(delim)
        .ok_or_else(|| parse_err("missing start delimiter"))?;
    let end = find_subslice(after_start, delim)
        .ok_or_else(|| parse_err("missing end delimiter"))?;
    let header = &after_start[..end];
    let after_end = &after_start[end + delim.len()..];
    let body = after_end
        .strip_prefix(b"\n")
        .ok_or_else(|| parse_err("end delimiter is not followed by a newline"))?;

    let metadata: FileMetadata = serde_json::from_slice(header)
        .map_err(|e| parse_err(&format!("invalid metadata JSON: {}", e)))?;
    validate_permissions(metadata.permissions)
        .map_err(|reason| parse_err(&reason))?;

    Ok((metadata, body.to_vec()))
}

/// Right inverse of [`extract`]: emits `delimiter + json + delimiter + "\n" + body`.
pub fn serialize_with_header(metadata: &FileMetadata, body: &[u8]) -> Vec<u8> {
    let json = serde_json::to_string(metadata).expect("metadata serializes");
    let mut out = Vec::with_capacity(2 * METADATA_DELIMITER.len() + json.len() + 2 + body.len());
    out.extend_from_slice(METADATA_DELIMITER.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(json.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(METADATA_DELIMITER.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

fn validate_permissions(mode: u32) -> Result<(), String> {
    if mode > 7777 {
        return Err(format!("FilePermissions {} is not an octal mode", mode));
    }
    let mut rest = mode;
    while rest > 0 {
        if rest % 10 > 7 {
            return Err(format!("FilePermissions {} is not an octal mode", mode));
        }
        rest /= 10;
    }
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
