use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use url::Url;

use crate::error::{CoreError, CoreResult};

/// Variant playlists are followed at most this deep.
pub const MAX_VARIANT_DEPTH: usize = 4;

pub fn parse_playlist(content: &[u8], url: &str) -> CoreResult<Playlist> {
    match m3u8_rs::parse_playlist(content) {
        Ok((_, playlist)) => Ok(playlist),
        Err(_) => Err(CoreError::Transfer(format!(
            "failed to parse m3u8 playlist {}",
            url
        ))),
    }
}

/// Absolute URL of the highest-bandwidth variant.
pub fn select_best_variant(master: &MasterPlaylist, base_url: &str) -> Option<String> {
    master
        .variants
        .iter()
        .filter(|variant| !variant.is_i_frame)
        .max_by_key(|variant| variant.bandwidth)
        .map(|variant| join_url(base_url, &variant.uri))
}

pub fn segment_urls(media: &MediaPlaylist, base_url: &str) -> Vec<String> {
    media
        .segments
        .iter()
        .map(|segment| join_url(base_url, &segment.uri))
        .collect()
}

fn join_url(base_url: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match Url::parse(base_url).and_then(|base| base.join(uri)) {
        Ok(joined) => joined.to_string(),
        Err(_) => uri.to_string(),
    }
}
