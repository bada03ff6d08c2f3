//! Descriptor fixtures and polling helpers.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use kestrel_torrent_core::{DescriptorParser, TaskId, TaskSource, TaskSpec};

/// Any descriptor containing this marker makes [`FixtureParser`] panic.
pub const PANIC_MARKER: &str = "kestrel-panic";

const MAGNET_PREFIX: &str = "magnet:?";
const INFO_HASH_PREFIX: &str = "urn:btih:";

/// Build a magnet URI understood by [`FixtureParser`].
#[must_use]
pub fn magnet_uri(info_hash: &str, name: &str) -> String {
    format!("{MAGNET_PREFIX}xt={INFO_HASH_PREFIX}{info_hash}&dn={name}")
}

/// Line-oriented stand-in for a real manifest.
///
/// ```text
/// id=<info hash>
/// name=<display name>
/// file=<relative path>|<length>
/// tracker=<announce url>
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureManifest {
    /// Task identity.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Files as `(path, length)`.
    pub files: Vec<(String, u64)>,
    /// Announce list.
    pub trackers: Vec<String>,
}

impl FixtureManifest {
    /// Start a manifest with no files.
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Append a file entry.
    #[must_use]
    pub fn with_file(mut self, path: &str, length: u64) -> Self {
        self.files.push((path.to_string(), length));
        self
    }

    /// Append an announce url.
    #[must_use]
    pub fn with_tracker(mut self, url: &str) -> Self {
        self.trackers.push(url.to_string());
        self
    }

    /// Encode to manifest bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("id={}\nname={}\n", self.id, self.name);
        for (path, length) in &self.files {
            out.push_str(&format!("file={path}|{length}\n"));
        }
        for tracker in &self.trackers {
            out.push_str(&format!("tracker={tracker}\n"));
        }
        out.into_bytes()
    }

    /// Decode manifest bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not UTF-8, a line is malformed, or
    /// the identity is missing.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).context("manifest is not valid UTF-8")?;
        let mut manifest = Self::default();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("manifest line without '=': {line}"))?;
            match key {
                "id" => value.clone_into(&mut manifest.id),
                "name" => value.clone_into(&mut manifest.name),
                "file" => {
                    let (path, length) = value
                        .rsplit_once('|')
                        .ok_or_else(|| anyhow!("file entry without length: {value}"))?;
                    let length = length
                        .parse()
                        .with_context(|| format!("invalid file length in {value}"))?;
                    manifest.files.push((path.to_string(), length));
                }
                "tracker" => manifest.trackers.push(value.to_string()),
                other => bail!("unknown manifest key {other}"),
            }
        }
        if manifest.id.is_empty() {
            bail!("manifest is missing an id");
        }
        Ok(manifest)
    }
}

/// Parser for [`magnet_uri`] strings and [`FixtureManifest`] payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureParser;

impl DescriptorParser for FixtureParser {
    fn parse_magnet(&self, uri: &str) -> Result<TaskSpec> {
        assert!(!uri.contains(PANIC_MARKER), "fixture parser exploded on {uri}");
        let query = uri
            .strip_prefix(MAGNET_PREFIX)
            .ok_or_else(|| anyhow!("not a magnet uri"))?;

        let mut id = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("xt", value)) => {
                    id = value.strip_prefix(INFO_HASH_PREFIX).map(TaskId::new);
                }
                Some(("dn", value)) => name = Some(value.to_string()),
                Some(("tr", value)) => trackers.push(value.to_string()),
                _ => {}
            }
        }
        let id = id.ok_or_else(|| anyhow!("magnet uri has no info hash"))?;
        Ok(TaskSpec {
            display_name: name.unwrap_or_else(|| id.to_string()),
            id,
            trackers,
            source: TaskSource::magnet(uri),
        })
    }

    fn parse_manifest(&self, bytes: &[u8]) -> Result<TaskSpec> {
        assert!(
            !String::from_utf8_lossy(bytes).contains(PANIC_MARKER),
            "fixture parser exploded on manifest"
        );
        let manifest = FixtureManifest::decode(bytes)?;
        Ok(TaskSpec {
            id: TaskId::new(&manifest.id),
            display_name: manifest.name,
            trackers: manifest.trackers,
            source: TaskSource::manifest(bytes),
        })
    }
}

/// Poll `check` until it holds or `limit` elapses.
///
/// # Errors
///
/// Returns an error naming `what` when the condition never held.
pub async fn wait_until<F, Fut>(what: &str, limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let outcome = tokio::time::timeout(limit, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    outcome.map_err(|_| anyhow!("timed out waiting for {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_torrent_core::TaskKind;

    #[test]
    fn magnet_fixture_parses_identity_and_trackers() -> Result<()> {
        let uri = format!("{}&tr=udp://t.example:1", magnet_uri("ABCD", "demo"));
        let spec = FixtureParser.parse_magnet(&uri)?;
        assert_eq!(spec.id.as_str(), "abcd");
        assert_eq!(spec.display_name, "demo");
        assert_eq!(spec.trackers, vec!["udp://t.example:1".to_string()]);
        assert_eq!(spec.kind(), TaskKind::Magnet);
        Ok(())
    }

    #[test]
    fn manifest_fixture_survives_encoding() -> Result<()> {
        let manifest = FixtureManifest::new("ff00", "album")
            .with_file("album/a.flac", 10)
            .with_file("album/b.flac", 20)
            .with_tracker("udp://t.example:1");
        assert_eq!(FixtureManifest::decode(&manifest.encode())?, manifest);

        let spec = FixtureParser.parse_manifest(&manifest.encode())?;
        assert_eq!(spec.id.as_str(), "ff00");
        assert_eq!(spec.kind(), TaskKind::Manifest);
        Ok(())
    }

    #[test]
    fn malformed_inputs_are_errors() {
        assert!(FixtureParser.parse_magnet("http://nope").is_err());
        assert!(FixtureParser.parse_magnet("magnet:?dn=x").is_err());
        assert!(FixtureParser.parse_manifest(b"name=x").is_err());
        assert!(FixtureParser.parse_manifest(&[0xff, 0xfe]).is_err());
    }

    #[test]
    #[should_panic(expected = "exploded")]
    fn panic_marker_panics() {
        let _ = FixtureParser.parse_magnet(&magnet_uri("aa", PANIC_MARKER));
    }

    #[tokio::test]
    async fn wait_until_reports_timeouts() {
        assert!(
            wait_until("never", Duration::from_millis(20), || async { false })
                .await
                .is_err()
        );
        assert!(
            wait_until("always", Duration::from_millis(20), || async { true })
                .await
                .is_ok()
        );
    }
}
