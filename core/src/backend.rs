use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use m3u8_rs::Playlist;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::checksum::{verify_checksum, ChecksumRequest};
use crate::config::JobOptions;
use crate::error::{CoreError, CoreResult};
use crate::hls::{self, MAX_VARIANT_DEPTH};
use crate::net::{DownloadRequest, NetClient};
use crate::throttle::Throttle;

const COPY_BUFFER: usize = 1024 * 64;
const CHILD_POLL: Duration = Duration::from_millis(50);

/// Per-call parameters every backend receives.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub options: Arc<JobOptions>,
    pub cancel: CancelToken,
}

impl TransferContext {
    pub fn new(options: Arc<JobOptions>, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    fn check_cancelled(&self, url: &str) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Transfer(format!("cancelled: {}", url)));
        }
        Ok(())
    }
}

/// A downloader for one transfer type. `download` returns `Ok` only once the
/// complete file is at `dest`.
pub trait TransferBackend: Send + Sync {
    fn transfer_type(&self) -> &str;

    fn download(
        &self,
        url: &str,
        dest: &Path,
        extra: Option<&Value>,
        ctx: &TransferContext,
    ) -> CoreResult<()>;
}

pub fn temp_path(dest: &Path) -> PathBuf {
    let mut os: OsString = dest.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Builds a request from the `headers` and `cookies` objects of `extra`.
pub fn request_from_extra(url: &str, extra: Option<&Value>) -> CoreResult<DownloadRequest> {
    let mut req = DownloadRequest::new(url);
    if let Some(extra) = extra {
        req.headers = string_map(extra, "headers")?;
        req.cookies = string_map(extra, "cookies")?;
    }
    Ok(req)
}

fn string_map(extra: &Value, key: &str) -> CoreResult<HashMap<String, String>> {
    let mut out = HashMap::new();
    let Some(value) = extra.get(key) else {
        return Ok(out);
    };
    let object = value
        .as_object()
        .ok_or_else(|| CoreError::Config(format!("extra.{} must be an object", key)))?;
    for (name, value) in object {
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn copy_body(
    body: &mut dyn Read,
    out: &mut dyn Write,
    throttle: &Throttle,
    ctx: &TransferContext,
    url: &str,
) -> CoreResult<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut written = 0u64;
    loop {
        ctx.check_cancelled(url)?;
        let read = body
            .read(&mut buffer)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])?;
        written += read as u64;
        throttle.throttle(read as u64, &ctx.cancel);
    }
    Ok(written)
}

fn fetch_into(
    net: &dyn NetClient,
    req: &DownloadRequest,
    out: &mut dyn Write,
    throttle: &Throttle,
    ctx: &TransferContext,
) -> CoreResult<u64> {
    let mut resp = net.get(req)?;
    if !resp.is_success() {
        return Err(CoreError::Network(format!(
            "{} answered status {}",
            req.url, resp.status_code
        )));
    }
    let written = copy_body(resp.body.as_mut(), out, throttle, ctx, &req.url)?;
    if let Some(expected) = resp.content_length {
        if written < expected {
            return Err(CoreError::Network(format!(
                "{} ended after {} of {} bytes",
                req.url, written, expected
            )));
        }
    }
    Ok(written)
}

fn finish_temp(tmp: &Path, dest: &Path, extra: Option<&Value>) -> CoreResult<()> {
    fs::rename(tmp, dest)?;
    if let Some(req) = ChecksumRequest::from_extra(extra)? {
        if let Err(err) = verify_checksum(dest, &req) {
            let _ = fs::remove_file(dest);
            return Err(err);
        }
    }
    Ok(())
}

/// Plain HTTP(S) download, retried `connect_retry` times.
pub struct HttpBackend {
    net: Arc<dyn NetClient>,
    throttle: Throttle,
}

impl HttpBackend {
    pub const TYPE: &'static str = "http";

    pub fn new(net: Arc<dyn NetClient>, throttle: Throttle) -> Self {
        Self { net, throttle }
    }

    fn attempt(&self, req: &DownloadRequest, tmp: &Path, ctx: &TransferContext) -> CoreResult<()> {
        let file = File::create(tmp)?;
        let mut writer = BufWriter::new(file);
        fetch_into(self.net.as_ref(), req, &mut writer, &self.throttle, ctx)?;
        writer.flush()?;
        Ok(())
    }
}

impl TransferBackend for HttpBackend {
    fn transfer_type(&self) -> &str {
        Self::TYPE
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        extra: Option<&Value>,
        ctx: &TransferContext,
    ) -> CoreResult<()> {
        let req = request_from_extra(url, extra)?;
        let tmp = temp_path(dest);
        let attempts = ctx.options.connect_retry.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            ctx.check_cancelled(url)?;
            match self.attempt(&req, &tmp, ctx) {
                Ok(()) => return finish_temp(&tmp, dest, extra),
                Err(err) => {
                    let _ = fs::remove_file(&tmp);
                    if ctx.cancel.is_cancelled() {
                        return Err(err);
                    }
                    if attempt < attempts {
                        warn!(url = %url, attempt, error = %err, "http transfer failed, retrying");
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::Network(format!("failed to fetch {}", url))))
    }
}

/// HLS download: follows the best master variant and concatenates the media
/// segments in playlist order.
pub struct M3u8Backend {
    net: Arc<dyn NetClient>,
    throttle: Throttle,
}

impl M3u8Backend {
    pub const TYPE: &'static str = "m3u8";

    pub fn new(net: Arc<dyn NetClient>, throttle: Throttle) -> Self {
        Self { net, throttle }
    }

    fn fetch_text(&self, req: &DownloadRequest, ctx: &TransferContext) -> CoreResult<Vec<u8>> {
        let mut body = Vec::new();
        fetch_into(self.net.as_ref(), req, &mut body, &Throttle::default(), ctx)?;
        Ok(body)
    }

    fn segment_urls(&self, url: &str, extra: Option<&Value>, ctx: &TransferContext) -> CoreResult<Vec<String>> {
        let mut playlist_url = url.to_string();
        for _ in 0..MAX_VARIANT_DEPTH {
            let req = request_from_extra(&playlist_url, extra)?;
            let content = self.fetch_text(&req, ctx)?;
            match hls::parse_playlist(&content, &playlist_url)? {
                Playlist::MasterPlaylist(master) => {
                    playlist_url = hls::select_best_variant(&master, &playlist_url).ok_or_else(|| {
                        CoreError::Transfer(format!("no variant in master playlist {}", playlist_url))
                    })?;
                    debug!(url = %url, variant = %playlist_url, "following hls variant");
                }
                Playlist::MediaPlaylist(media) => {
                    let segments = hls::segment_urls(&media, &playlist_url);
                    if segments.is_empty() {
                        return Err(CoreError::Transfer(format!("empty playlist {}", playlist_url)));
                    }
                    return Ok(segments);
                }
            }
        }
        Err(CoreError::Transfer(format!("too many nested playlists under {}", url)))
    }
}

impl TransferBackend for M3u8Backend {
    fn transfer_type(&self) -> &str {
        Self::TYPE
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        extra: Option<&Value>,
        ctx: &TransferContext,
    ) -> CoreResult<()> {
        let segments = self.segment_urls(url, extra, ctx)?;
        let tmp = temp_path(dest);
        let result = (|| -> CoreResult<()> {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let attempts = ctx.options.connect_retry.max(1);
            for segment in &segments {
                let req = request_from_extra(segment, extra)?;
                let mut fetched = Vec::new();
                let mut last_error = None;
                for _ in 0..attempts {
                    ctx.check_cancelled(url)?;
                    fetched.clear();
                    match fetch_into(self.net.as_ref(), &req, &mut fetched, &self.throttle, ctx) {
                        Ok(_) => {
                            last_error = None;
                            break;
                        }
                        Err(err) => last_error = Some(err),
                    }
                }
                if let Some(err) = last_error {
                    return Err(err);
                }
                writer.write_all(&fetched)?;
            }
            writer.flush()?;
            Ok(())
        })();
        match result {
            Ok(()) => finish_temp(&tmp, dest, extra),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }
}

/// Shells out to an external downloader. `{url}`, `{dest}` and `{dir}` in the
/// arguments are substituted per file; a non-zero exit is a failure.
pub struct CommandBackend {
    transfer_type: String,
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(transfer_type: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transfer_type: transfer_type.into(),
            program: program.into(),
            args,
        }
    }

    fn render(&self, url: &str, dest: &Path) -> Vec<String> {
        let dir = dest
            .parent()
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", url)
                    .replace("{dest}", &dest)
                    .replace("{dir}", &dir)
            })
            .collect()
    }
}

impl TransferBackend for CommandBackend {
    fn transfer_type(&self) -> &str {
        &self.transfer_type
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        _extra: Option<&Value>,
        ctx: &TransferContext,
    ) -> CoreResult<()> {
        let args = self.render(url, dest);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CoreError::Transfer(format!("spawn {}: {}", self.program, err)))?;
        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                return Err(CoreError::Transfer(format!(
                    "{} exited with {} for {}",
                    self.program, status, url
                )));
            }
            if ctx.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CoreError::Transfer(format!("cancelled: {}", url)));
            }
            thread::sleep(CHILD_POLL);
        }
    }
}
