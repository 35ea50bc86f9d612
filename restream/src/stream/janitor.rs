//! Segment janitor: keeps a channel's output directory bounded.
//!
//! Each tick lists `segment_*.ts`, orders it oldest first by mtime and
//! deletes everything beyond the newest `max_segments + safety_margin`
//! files, skipping segments that are younger than the minimum-age guard or
//! still referenced by the current playlist.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use m3u8_rs::{ExtTag, Playlist, parse_playlist_res};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RetentionConfig;
use super::worker::{PLAYLIST_FILE_NAME, segment_index};
use crate::utils::fs::age_of;

/// One segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Result of one janitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Pick the segments to delete.
///
/// Only the oldest `segments.len() - keep` files are candidates; of those,
/// files not older than `min_age` and files named in `referenced` stay.
pub fn select_for_deletion(
    mut segments: Vec<SegmentFile>,
    keep: usize,
    min_age: Duration,
    now: SystemTime,
    referenced: &HashSet<String>,
) -> Vec<SegmentFile> {
    segments.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

    let excess = segments.len().saturating_sub(keep);
    segments.truncate(excess);
    segments.retain(|s| age_of(s.modified, now) > min_age && !referenced.contains(&s.name));
    segments
}

/// File name a playlist URI points at, without query, fragment or directories.
fn uri_file_name(uri: &str) -> &str {
    let uri = uri.split(['?', '#']).next().unwrap_or(uri);
    uri.rsplit('/').next().unwrap_or(uri)
}

/// `URI="..."` attribute of a tag ffmpeg writes outside the segment lines,
/// such as `EXT-X-MAP` or `EXT-X-PART`.
fn tag_uri(tag: &ExtTag) -> Option<&str> {
    let rest = tag.rest.as_deref()?;
    let start = rest.find("URI=\"")? + "URI=\"".len();
    let len = rest[start..].find('"')?;
    Some(&rest[start..start + len])
}

/// File names a media playlist still references.
///
/// `None` when the bytes are not a media playlist; the caller must then
/// treat every file as referenced.
pub fn parse_playlist_references(playlist: &[u8]) -> Option<HashSet<String>> {
    let media = match parse_playlist_res(playlist) {
        Ok(Playlist::MediaPlaylist(media)) => media,
        Ok(Playlist::MasterPlaylist(_)) | Err(_) => return None,
    };

    let segment_uris = media.segments.iter().flat_map(|segment| {
        std::iter::once(segment.uri.as_str())
            .chain(segment.map.as_ref().map(|map| map.uri.as_str()))
            .chain(segment.unknown_tags.iter().filter_map(tag_uri))
    });
    // EXT-X-MAP before the first segment lands in the playlist-level tags.
    let playlist_uris = media.unknown_tags.iter().filter_map(tag_uri);

    Some(
        segment_uris
            .chain(playlist_uris)
            .map(uri_file_name)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Segment names referenced by the playlist in `dir`.
///
/// A missing playlist references nothing. `None` when the playlist exists
/// but cannot be read or parsed.
pub async fn referenced_segments(dir: &Path) -> Option<HashSet<String>> {
    match tokio::fs::read(dir.join(PLAYLIST_FILE_NAME)).await {
        Ok(bytes) => parse_playlist_references(&bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Some(HashSet::new()),
        Err(_) => None,
    }
}

/// Segment files currently in `dir`.
pub async fn list_segments(dir: &Path) -> io::Result<Vec<SegmentFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if segment_index(&name).is_none() {
            continue;
        }
        // The transcoder may have replaced or removed it since the listing.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        segments.push(SegmentFile {
            name,
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(segments)
}

/// Number of segment files in `dir`; zero if it does not exist.
pub async fn count_segments(dir: &Path) -> usize {
    list_segments(dir).await.map(|s| s.len()).unwrap_or(0)
}

/// Run one janitor pass over `dir`.
pub async fn sweep(channel_id: &str, dir: &Path, retention: &RetentionConfig) -> SweepStats {
    let segments = match list_segments(dir).await {
        Ok(segments) => segments,
        Err(e) => {
            debug!(channel_id, dir = %dir.display(), error = %e, "Cannot list segments");
            return SweepStats::default();
        }
    };

    let mut stats = SweepStats {
        scanned: segments.len(),
        ..Default::default()
    };

    // A playlist caught mid-write or otherwise unreadable protects everything.
    let Some(referenced) = referenced_segments(dir).await else {
        debug!(channel_id, dir = %dir.display(), "Playlist unreadable, skipping sweep");
        return stats;
    };
    let victims = select_for_deletion(
        segments,
        retention.keep_count(),
        retention.min_segment_age,
        SystemTime::now(),
        &referenced,
    );

    for segment in victims {
        match tokio::fs::remove_file(&segment.path).await {
            Ok(()) => stats.deleted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                stats.failed += 1;
                warn!(
                    channel_id,
                    segment = %segment.name,
                    error = %e,
                    "Failed to delete segment"
                );
            }
        }
    }

    stats
}

/// Periodic segment cleanup for one channel session.
pub struct SegmentJanitor {
    channel_id: String,
    output_dir: PathBuf,
    retention: RetentionConfig,
    interval: Duration,
    token: CancellationToken,
}

impl SegmentJanitor {
    pub fn new(
        channel_id: impl Into<String>,
        output_dir: PathBuf,
        retention: RetentionConfig,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            output_dir,
            retention,
            interval,
            token,
        }
    }

    /// Sweep every interval until the session token is cancelled.
    pub async fn run(self) {
        debug!(channel_id = %self.channel_id, "Segment janitor started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let stats = tokio::select! {
                _ = self.token.cancelled() => break,
                stats = sweep(&self.channel_id, &self.output_dir, &self.retention) => stats,
            };

            if stats.deleted > 0 || stats.failed > 0 {
                info!(
                    channel_id = %self.channel_id,
                    scanned = stats.scanned,
                    deleted = stats.deleted,
                    failed = stats.failed,
                    "Trimmed segments"
                );
            }
        }

        debug!(channel_id = %self.channel_id, "Segment janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn segment(index: u64, modified: SystemTime) -> SegmentFile {
        let name = format!("segment_{:06}.ts", index);
        SegmentFile {
            path: PathBuf::from("/hls/news1").join(&name),
            name,
            modified,
        }
    }

    #[test]
    fn test_select_keeps_newest_window() {
        let now = SystemTime::now();
        let segments: Vec<_> = (0..10)
            .map(|i| segment(i, now - Duration::from_secs(100 - i * 4)))
            .collect();

        let victims = select_for_deletion(segments, 8, Duration::from_secs(30), now, &HashSet::new());
        let names: Vec<_> = victims.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["segment_000000.ts", "segment_000001.ts"]);
    }

    #[test]
    fn test_select_respects_min_age_and_references() {
        let now = SystemTime::now();
        let segments = vec![
            segment(0, now - Duration::from_secs(120)),
            segment(1, now - Duration::from_secs(110)),
            segment(2, now - Duration::from_secs(5)),
            segment(3, now - Duration::from_secs(4)),
        ];
        let referenced: HashSet<_> = ["segment_000001.ts".to_string()].into();

        let victims = select_for_deletion(segments, 1, Duration::from_secs(30), now, &referenced);
        let names: Vec<_> = victims.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["segment_000000.ts"]);
    }

    #[test]
    fn test_parse_playlist_references() {
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n\
                        #EXTINF:4.000000,\nsegment_000010.ts\n\
                        #EXTINF:4.000000,\n/hls/news1/segment_000011.ts?token=1\n";
        let refs = parse_playlist_references(playlist.as_bytes()).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("segment_000010.ts"));
        assert!(refs.contains("segment_000011.ts"));
    }

    #[test]
    fn test_parse_playlist_references_includes_init_segment() {
        let playlist = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n\
                        #EXT-X-MAP:URI=\"init.mp4\"\n\
                        #EXTINF:4.000000,\nsegment_000010.m4s\n";
        let refs = parse_playlist_references(playlist.as_bytes()).unwrap();
        assert!(refs.contains("init.mp4"));
        assert!(refs.contains("segment_000010.m4s"));
    }

    #[test]
    fn test_parse_playlist_references_rejects_garbage() {
        assert!(parse_playlist_references(b"segment_000010.ts\n").is_none());
        assert!(parse_playlist_references(b"").is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_everything_when_playlist_unparsable() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();

        for i in 0..5u64 {
            let path = dir.join(format!("segment_{:06}.ts", i));
            tokio::fs::write(&path, b"ts").await.unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(600 - i * 10))
                .unwrap();
        }
        // Truncated write: no #EXTM3U header.
        tokio::fs::write(dir.join(PLAYLIST_FILE_NAME), "#EXTINF:4.0,\nsegm")
            .await
            .unwrap();

        let retention = RetentionConfig {
            max_segments: 1,
            safety_margin: 0,
            min_segment_age: Duration::ZERO,
            ..Default::default()
        };
        let stats = sweep("news1", dir, &retention).await;

        assert_eq!(stats.scanned, 5);
        assert_eq!(stats.deleted, 0);
        assert_eq!(count_segments(dir).await, 5);
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_unreferenced_segments() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();

        for i in 0..6u64 {
            let path = dir.join(format!("segment_{:06}.ts", i));
            tokio::fs::write(&path, b"ts").await.unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(600 - i * 10))
                .unwrap();
        }
        // Oldest segment still listed by the playlist.
        tokio::fs::write(
            dir.join(PLAYLIST_FILE_NAME),
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nsegment_000000.ts\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("transcoder.log"), b"log").await.unwrap();

        let retention = RetentionConfig {
            max_segments: 2,
            safety_margin: 1,
            min_segment_age: Duration::ZERO,
            ..Default::default()
        };
        let stats = sweep("news1", dir, &retention).await;

        assert_eq!(stats.scanned, 6);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.failed, 0);

        let mut remaining: Vec<_> = list_segments(dir)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "segment_000000.ts",
                "segment_000003.ts",
                "segment_000004.ts",
                "segment_000005.ts"
            ]
        );
        assert!(dir.join("transcoder.log").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_directory_is_noop() {
        let temp = TempDir::new().unwrap();
        let stats = sweep("news1", &temp.path().join("gone"), &RetentionConfig::default()).await;
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn test_janitor_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let janitor = SegmentJanitor::new(
            "news1",
            temp.path().to_path_buf(),
            RetentionConfig::default(),
            Duration::from_millis(10),
            token.clone(),
        );

        let handle = tokio::spawn(janitor.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("janitor should exit after cancellation")
            .unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_selection_bounds_old_segments(
            ages in prop::collection::vec(0u64..600, 0..40),
            keep in 0usize..12,
            min_age in 0u64..120,
            referenced_mask in prop::collection::vec(any::<bool>(), 40),
        ) {
            let now = SystemTime::now();
            let segments: Vec<_> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| segment(i as u64, now - Duration::from_secs(*age)))
                .collect();
            let referenced: HashSet<String> = segments
                .iter()
                .zip(referenced_mask.iter())
                .filter(|(_, r)| **r)
                .map(|(s, _)| s.name.clone())
                .collect();
            let min_age = Duration::from_secs(min_age);

            let victims = select_for_deletion(segments.clone(), keep, min_age, now, &referenced);
            let victim_names: HashSet<_> = victims.iter().map(|s| s.name.clone()).collect();

            for victim in &victims {
                prop_assert!(age_of(victim.modified, now) > min_age);
                prop_assert!(!referenced.contains(&victim.name));
            }

            // Survivors that are old and unreferenced fit in the window.
            let leftover_old = segments
                .iter()
                .filter(|s| !victim_names.contains(&s.name))
                .filter(|s| age_of(s.modified, now) > min_age && !referenced.contains(&s.name))
                .count();
            prop_assert!(leftover_old <= keep);
        }
    }
}
