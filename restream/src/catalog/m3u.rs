//! Extended M3U rendering for IPTV players.
//!
//! Each entry points at the channel's local HLS entry point rather than the
//! upstream source, so players always go through the supervisor's output.

use std::fmt::Write;

use super::ChannelDescriptor;

/// Path of a channel's HLS entry point relative to the server root.
pub fn hls_entry_path(channel_id: &str) -> String {
    format!("/hls/{}/index.m3u8", channel_id)
}

/// Render an `#EXTM3U` playlist listing `channels`.
pub fn render_playlist(channels: &[ChannelDescriptor], base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    let mut out = String::from("#EXTM3U\n");

    for channel in channels {
        let _ = write!(
            out,
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\"",
            attr(&channel.id),
            attr(&channel.name)
        );
        if let Some(logo) = &channel.logo {
            let _ = write!(out, " tvg-logo=\"{}\"", attr(logo));
        }
        if let Some(group) = &channel.group {
            let _ = write!(out, " group-title=\"{}\"", attr(group));
        }
        let _ = writeln!(out, ",{}", channel.name.replace(['\r', '\n'], " "));
        let _ = writeln!(out, "{}{}", base_url, hls_entry_path(&channel.id));
    }

    out
}

fn attr(value: &str) -> String {
    value.replace(['"', '\r', '\n'], "")
}
