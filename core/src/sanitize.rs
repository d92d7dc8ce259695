use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use url::Url;

/// In-band token inside a volume name that splits it into nested directories.
pub const PATH_SPLIT: &str = "{$path_split$}";

pub const MAX_FILE_NAME_CHARS: usize = 100;

const REPLACED_CHARS: [char; 12] = ['*', '|', ':', '?', '/', '<', '>', '"', ' ', '\'', '\\', '-'];

/// Makes a string usable as a single directory or file name.
pub fn path_char_replace(name: &str) -> String {
    name.chars()
        .map(|ch| if REPLACED_CHARS.contains(&ch) { '_' } else { ch })
        .collect()
}

/// Caps a file name at [`MAX_FILE_NAME_CHARS`] while keeping its extension.
pub fn cap_file_name(name: &str) -> String {
    if name.chars().count() <= MAX_FILE_NAME_CHARS {
        return name.to_string();
    }
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "",
    };
    let ext_len = ext.chars().count();
    if ext_len == 0 || ext_len + 2 > MAX_FILE_NAME_CHARS {
        return name.chars().take(MAX_FILE_NAME_CHARS).collect();
    }
    let stem: String = name.chars().take(MAX_FILE_NAME_CHARS - 1 - ext_len).collect();
    format!("{}.{}", stem, ext)
}

/// Sanitized and length-capped file name as stored in the ledger.
pub fn ledger_file_name(name: &str) -> String {
    cap_file_name(&path_char_replace(name))
}

/// Directory for a volume below the job directory, honouring [`PATH_SPLIT`].
pub fn volume_dir(job_dir: &Path, volume_name: &str) -> PathBuf {
    let mut dir = job_dir.to_path_buf();
    for part in volume_name.split(PATH_SPLIT) {
        let part = part.trim();
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        dir.push(part);
    }
    dir
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path().rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        return None;
    }
    let decoded = percent_decode(name);
    if decoded.is_empty() {
        None
    } else {
        Some(ledger_file_name(&decoded))
    }
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8_lossy()
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' { '_' } else { ch })
        .collect()
}
