use std::any::Any;
use std::fs;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::config::JobOptions;
use crate::error::{CoreError, CoreResult};

/// Driver-defined state carried from one volume's file listing to the next,
/// e.g. an open browser session.
pub type CarryState = Box<dyn Any + Send>;

#[derive(Debug, Clone, Default)]
pub struct VolumePage {
    /// Empty when there are no more pages.
    pub next_url: String,
    /// `(volume name, volume url)` in discovery order.
    pub volumes: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub name: String,
    pub url: String,
    pub transfer_type: String,
    pub extra: Option<Value>,
}

#[derive(Default)]
pub struct FilePage {
    pub carry: Option<CarryState>,
    pub files: Vec<DiscoveredFile>,
}

/// Site-specific discovery of a work's name, volumes and files. Every method
/// fails loudly rather than returning an empty success.
pub trait SiteDriver: Send + Sync {
    fn id(&self) -> &str;

    /// Route keys: upper-cased hosts, or `SCHEME://` for host-less URLs.
    fn supports(&self) -> Vec<String>;

    fn get_name_by_url(&self, url: &str, options: &JobOptions) -> CoreResult<String>;

    fn get_volume_page(&self, url: &str, options: &JobOptions) -> CoreResult<VolumePage>;

    fn get_file_page(
        &self,
        volume_url: &str,
        carry: Option<CarryState>,
        options: &JobOptions,
    ) -> CoreResult<FilePage>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    next: String,
    #[serde(default)]
    volumes: Vec<ManifestVolume>,
}

#[derive(Debug, Deserialize)]
struct ManifestVolume {
    name: String,
    #[serde(default)]
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    name: String,
    url: String,
    #[serde(default = "default_transfer_type")]
    transfer_type: String,
    #[serde(default)]
    extra: Option<Value>,
}

fn default_transfer_type() -> String {
    "http".to_string()
}

/// Reads works described by local JSON manifests (`file://` URLs).
///
/// A manifest lists volumes with their files and may point at the next
/// manifest page through `next`. Volume URLs are the manifest URL with a
/// `#vol=<index>` fragment.
#[derive(Debug, Default, Clone)]
pub struct ManifestDriver;

impl ManifestDriver {
    pub const ID: &'static str = "manifest";

    fn load(url: &str) -> CoreResult<(Url, Manifest)> {
        let mut parsed =
            Url::parse(url).map_err(|err| CoreError::Driver(format!("bad url {}: {}", url, err)))?;
        parsed.set_fragment(None);
        let path = parsed
            .to_file_path()
            .map_err(|_| CoreError::Driver(format!("not a file url: {}", url)))?;
        let bytes = fs::read(&path)
            .map_err(|err| CoreError::Driver(format!("read {}: {}", path.display(), err)))?;
        let manifest = serde_json::from_slice(&bytes)
            .map_err(|err| CoreError::Driver(format!("parse {}: {}", path.display(), err)))?;
        Ok((parsed, manifest))
    }

    fn volume_index(url: &str) -> CoreResult<usize> {
        let parsed =
            Url::parse(url).map_err(|err| CoreError::Driver(format!("bad url {}: {}", url, err)))?;
        parsed
            .fragment()
            .and_then(|fragment| fragment.strip_prefix("vol="))
            .and_then(|index| index.parse::<usize>().ok())
            .ok_or_else(|| CoreError::Driver(format!("volume url without #vol=: {}", url)))
    }
}

impl SiteDriver for ManifestDriver {
    fn id(&self) -> &str {
        Self::ID
    }

    fn supports(&self) -> Vec<String> {
        vec!["FILE://".to_string()]
    }

    fn get_name_by_url(&self, url: &str, _options: &JobOptions) -> CoreResult<String> {
        let (_, manifest) = Self::load(url)?;
        if manifest.name.trim().is_empty() {
            return Err(CoreError::Driver(format!("manifest {} has no name", url)));
        }
        Ok(manifest.name)
    }

    fn get_volume_page(&self, url: &str, _options: &JobOptions) -> CoreResult<VolumePage> {
        let (base, manifest) = Self::load(url)?;
        let volumes = manifest
            .volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| {
                let mut volume_url = base.clone();
                volume_url.set_fragment(Some(&format!("vol={}", index)));
                (volume.name.clone(), volume_url.to_string())
            })
            .collect();
        Ok(VolumePage {
            next_url: manifest.next,
            volumes,
        })
    }

    fn get_file_page(
        &self,
        volume_url: &str,
        _carry: Option<CarryState>,
        _options: &JobOptions,
    ) -> CoreResult<FilePage> {
        let index = Self::volume_index(volume_url)?;
        let (_, manifest) = Self::load(volume_url)?;
        let volume = manifest
            .volumes
            .into_iter()
            .nth(index)
            .ok_or_else(|| CoreError::Driver(format!("no volume {} in {}", index, volume_url)))?;
        let files = volume
            .files
            .into_iter()
            .map(|file| DiscoveredFile {
                name: file.name,
                url: file.url,
                transfer_type: file.transfer_type,
                extra: file.extra,
            })
            .collect();
        Ok(FilePage { carry: None, files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_pages_volumes_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let page2 = dir.path().join("page2.json");
        let page1 = dir.path().join("page1.json");
        let page2_url = Url::from_file_path(&page2).unwrap().to_string();
        fs::write(
            &page2,
            r#"{"volumes": [{"name": "ch2", "files": [{"url": "http://img/2.jpg"}]}]}"#,
        )
        .unwrap();
        fs::write(
            &page1,
            format!(
                r#"{{"name": "Foo", "next": "{}", "volumes": [
                    {{"name": "ch1", "files": [
                        {{"name": "1.jpg", "url": "http://img/1.jpg", "transfer_type": "m3u8",
                          "extra": {{"headers": {{"Referer": "http://site"}}}}}}
                    ]}}
                ]}}"#,
                page2_url
            ),
        )
        .unwrap();

        let driver = ManifestDriver;
        let options = JobOptions::default();
        let page1_url = Url::from_file_path(&page1).unwrap().to_string();
        assert_eq!(driver.get_name_by_url(&page1_url, &options).unwrap(), "Foo");

        let page = driver.get_volume_page(&page1_url, &options).unwrap();
        assert_eq!(page.next_url, page2_url);
        assert_eq!(page.volumes.len(), 1);
        assert!(page.volumes[0].1.ends_with("#vol=0"));

        let files = driver.get_file_page(&page.volumes[0].1, None, &options).unwrap();
        assert_eq!(files.files[0].transfer_type, "m3u8");
        assert!(files.files[0].extra.is_some());

        let page = driver.get_volume_page(&page2_url, &options).unwrap();
        assert!(page.next_url.is_empty());
        let files = driver.get_file_page(&page.volumes[0].1, None, &options).unwrap();
        assert_eq!(files.files[0].transfer_type, "http");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let options = JobOptions::default();
        assert!(ManifestDriver
            .get_volume_page("file:///definitely/not/here.json", &options)
            .is_err());
    }
}
