//! Path routing.
//!
//! The mount root is synthesized: it contains the literal entries `$audio`
//! and `$system` plus the top-level children of the overlay tree. Everything
//! that is not under the two special directories traverses the overlay.

use mdfs_device::{TrackInfo, TrackEncoding};
use mdfs_types::HIDDEN_TITLE_PREFIX;

pub const AUDIO_DIR: &str = "$audio";
pub const SYSTEM_DIR: &str = "$system";

/// Where a path points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget<'a> {
    Root,
    AudioDir,
    AudioEntry(&'a str),
    SystemDir,
    SystemEntry(&'a str),
    /// Overlay tree traversal; the segment list is never empty.
    Overlay(Vec<&'a str>),
    /// Structurally impossible location, e.g. a path below an audio entry.
    Invalid,
}

/// Split a path and classify it.
#[must_use]
pub fn route(path: &str) -> PathTarget<'_> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.split_first() {
        None => PathTarget::Root,
        Some((&AUDIO_DIR, rest)) => match rest {
            [] => PathTarget::AudioDir,
            [name] => PathTarget::AudioEntry(name),
            _ => PathTarget::Invalid,
        },
        Some((&SYSTEM_DIR, rest)) => match rest {
            [] => PathTarget::SystemDir,
            [name] => PathTarget::SystemEntry(name),
            _ => PathTarget::Invalid,
        },
        Some(_) => PathTarget::Overlay(segments),
    }
}

/// Canonical form of a path: `/` plus its non-empty segments.
#[must_use]
pub fn canonical(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Listing name of an audio track: `"{index+1}. {title}.{ext}"`.
///
/// Slashes in the title become underscores; untitled tracks render as
/// `No Title`; the extension is `aea` for SP tracks, `wav` otherwise.
#[must_use]
pub fn audio_entry_name(track: &TrackInfo) -> String {
    let title = track
        .title
        .as_deref()
        .unwrap_or("No Title")
        .replace('/', "_");
    let ext = match track.encoding {
        TrackEncoding::Sp => "aea",
        TrackEncoding::Lp2 | TrackEncoding::Lp4 => "wav",
    };
    format!("{}. {}.{}", track.index.0 + 1, title, ext)
}

/// True for tracks that belong under `/$audio` (everything not backing an
/// overlay file).
#[must_use]
pub fn is_audio_track(track: &TrackInfo) -> bool {
    !track
        .title
        .as_deref()
        .is_some_and(|title| title.starts_with(HIDDEN_TITLE_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfs_types::TrackIndex;

    fn track(index: u16, title: Option<&str>, encoding: TrackEncoding) -> TrackInfo {
        TrackInfo {
            index: TrackIndex(index),
            title: title.map(str::to_owned),
            encoding,
        }
    }

    #[test]
    fn routing() {
        assert_eq!(route("/"), PathTarget::Root);
        assert_eq!(route(""), PathTarget::Root);
        assert_eq!(route("/$audio"), PathTarget::AudioDir);
        assert_eq!(route("/$audio/1. x.aea"), PathTarget::AudioEntry("1. x.aea"));
        assert_eq!(route("/$audio/a/b"), PathTarget::Invalid);
        assert_eq!(route("/$system"), PathTarget::SystemDir);
        assert_eq!(route("/$system/info"), PathTarget::SystemEntry("info"));
        assert_eq!(
            route("/docs//readme.txt"),
            PathTarget::Overlay(vec!["docs", "readme.txt"])
        );
    }

    #[test]
    fn canonical_forms() {
        assert_eq!(canonical("a/b/"), "/a/b");
        assert_eq!(canonical("/a//b"), "/a/b");
        assert_eq!(canonical("/"), "/");
    }

    #[test]
    fn audio_names_follow_the_listing_convention() {
        assert_eq!(
            audio_entry_name(&track(0, Some("Hello/World"), TrackEncoding::Sp)),
            "1. Hello_World.aea"
        );
        assert_eq!(
            audio_entry_name(&track(2, None, TrackEncoding::Lp2)),
            "3. No Title.wav"
        );
    }

    #[test]
    fn hidden_tracks_are_not_audio() {
        assert!(!is_audio_track(&track(1, Some("h_fs_00"), TrackEncoding::Lp2)));
        assert!(is_audio_track(&track(0, Some("song"), TrackEncoding::Sp)));
        assert!(is_audio_track(&track(2, None, TrackEncoding::Lp2)));
    }
}
