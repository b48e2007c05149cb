#![forbid(unsafe_code)]

//! Matching a requested resolution against what the source actually offers.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{FormatOption, height_selector};

/// Resolution tiers, highest first.
pub const LADDER: [u32; 8] = [4320, 2160, 1440, 1080, 720, 480, 360, 240];

/// Named heights accepted for whole-playlist downloads.
const PLAYLIST_HEIGHTS: [u32; 4] = [1080, 720, 480, 360];

static HEIGHT_FILTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"height<=?(\d+)").expect("valid height filter regex"));
static HEIGHT_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3,4})p$").expect("valid height label regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedQuality {
    Best,
    Height(u32),
}

/// Outcome of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Selector handed to the engine.
    pub selector: String,
    pub requested: String,
    pub actual: String,
    pub downgraded: bool,
    pub message: Option<String>,
}

impl Resolution {
    /// A request that bypasses resolution and is handed over as is.
    pub fn passthrough(selector: impl Into<String>, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            selector: selector.into(),
            requested: label.clone(),
            actual: label,
            downgraded: false,
            message: None,
        }
    }
}

/// Display name of a height, with the marketing name for the top tiers.
pub fn tier_label(height: u32) -> String {
    match height {
        4320 => "4320p (8K)".to_string(),
        2160 => "2160p (4K)".to_string(),
        1440 => "1440p (2K)".to_string(),
        other => format!("{other}p"),
    }
}

/// Interprets a selector or tier name coming from the client. A selector
/// naming one of the source's concrete formats resolves to that format's
/// height.
pub fn parse_requested(selector: &str, formats: &[FormatOption]) -> RequestedQuality {
    let normalized = selector.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "best" | "bestvideo+bestaudio/best" | "bestvideo+bestaudio" => {
            return RequestedQuality::Best;
        }
        "8k" => return RequestedQuality::Height(4320),
        "4k" => return RequestedQuality::Height(2160),
        "2k" => return RequestedQuality::Height(1440),
        _ => {}
    }
    if let Some(height) = HEIGHT_LABEL
        .captures(&normalized)
        .and_then(|caps| caps[1].parse().ok())
    {
        return RequestedQuality::Height(height);
    }
    if let Some(height) = formats
        .iter()
        .find(|format| format.format_selector == selector.trim())
        .and_then(|format| format.height)
    {
        return RequestedQuality::Height(height);
    }
    if let Some(height) = HEIGHT_FILTER
        .captures(&normalized)
        .and_then(|caps| caps[1].parse().ok())
    {
        return RequestedQuality::Height(height);
    }
    RequestedQuality::Best
}

/// Largest ladder rung at or below `height`.
pub fn snap_to_ladder(height: u32) -> Option<u32> {
    LADDER.iter().copied().find(|rung| *rung <= height)
}

/// Picks the height to download for `requested` given the heights the source
/// offers.
pub fn resolve_height(requested: u32, available: &[u32]) -> u32 {
    if available.is_empty() || available.contains(&requested) {
        return requested;
    }
    let target = available
        .iter()
        .copied()
        .filter(|height| *height <= requested)
        .max()
        .or_else(|| available.iter().copied().min())
        .unwrap_or(requested);
    let floor = available.iter().copied().min().unwrap_or(target);
    snap_to_ladder(target)
        .filter(|rung| *rung >= floor)
        .unwrap_or(target)
}

/// Resolves a single-video request. Audio, playlist, and `best` requests do
/// not come through here; see [`Resolution::passthrough`].
pub fn resolve(selector: &str, formats: &[FormatOption], available: &[u32]) -> Resolution {
    let requested = match parse_requested(selector, formats) {
        RequestedQuality::Best => return Resolution::passthrough(selector, "best"),
        RequestedQuality::Height(height) => height,
    };
    let resolved = resolve_height(requested, available);
    if resolved == requested {
        // Tier names are not engine selectors; concrete selectors stay verbatim.
        let selector = if HEIGHT_LABEL.is_match(&selector.trim().to_ascii_lowercase())
            || is_tier_alias(selector)
        {
            height_selector(requested)
        } else {
            selector.to_string()
        };
        return Resolution {
            selector,
            requested: tier_label(requested),
            actual: tier_label(requested),
            downgraded: false,
            message: None,
        };
    }
    let requested_label = tier_label(requested);
    let actual_label = tier_label(resolved);
    let message = format!(
        "{requested_label} is not available for this video; downloading {actual_label} instead"
    );
    Resolution {
        selector: height_selector(resolved),
        requested: requested_label,
        actual: actual_label,
        downgraded: true,
        message: Some(message),
    }
}

/// Maps a named playlist quality to a capped selector. Anything else is
/// handed to the engine unchanged.
pub fn playlist_selector(selector: &str) -> String {
    let normalized = selector.trim().to_ascii_lowercase();
    PLAYLIST_HEIGHTS
        .iter()
        .find(|height| normalized == format!("{height}p"))
        .map(|height| height_selector(*height))
        .unwrap_or_else(|| selector.trim().to_string())
}

fn is_tier_alias(selector: &str) -> bool {
    matches!(
        selector.trim().to_ascii_lowercase().as_str(),
        "8k" | "4k" | "2k"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combined(id: &str, height: u32) -> FormatOption {
        FormatOption {
            format_selector: id.into(),
            display_label: format!("{height}p (1200kbps) - MP4"),
            height: Some(height),
        }
    }

    #[test]
    fn present_tier_is_kept() {
        let resolution = resolve("720p", &[], &[1080, 720, 360]);
        assert!(!resolution.downgraded);
        assert_eq!(resolution.actual, "720p");
        assert_eq!(resolution.message, None);
        assert_eq!(
            resolution.selector,
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
    }

    #[test]
    fn tier_above_maximum_is_downgraded() {
        let resolution = resolve("2160p", &[], &[1080, 720, 360]);
        assert!(resolution.downgraded);
        assert_eq!(resolution.requested, "2160p (4K)");
        assert_eq!(resolution.actual, "1080p");
        let message = resolution.message.unwrap();
        assert!(message.contains("2160p (4K)"));
        assert!(message.contains("1080p"));
        assert_eq!(
            resolution.selector,
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]"
        );
    }

    #[test]
    fn odd_heights_snap_down_to_the_ladder() {
        assert_eq!(resolve_height(2160, &[1200, 600]), 1080);
        assert_eq!(resolve_height(600, &[1080, 590]), 590);
    }

    #[test]
    fn rungs_below_the_smallest_height_are_not_offered() {
        assert_eq!(resolve_height(480, &[1080, 544]), 544);

        let resolution = resolve("480p", &[], &[1080, 544]);
        assert!(resolution.downgraded);
        assert_eq!(resolution.actual, "544p");
        assert_eq!(
            resolution.selector,
            "bestvideo[height<=544]+bestaudio/best[height<=544]"
        );
        let message = resolution.message.unwrap();
        assert!(message.contains("480p"));
        assert!(message.contains("544p"));
    }

    #[test]
    fn requests_below_every_height_take_the_smallest() {
        assert_eq!(resolve_height(240, &[1080, 720]), 720);
        assert_eq!(resolve_height(240, &[144]), 144);
    }

    #[test]
    fn unknown_availability_keeps_the_request() {
        let resolution = resolve("1080p", &[], &[]);
        assert!(!resolution.downgraded);
        assert_eq!(resolution.actual, "1080p");
    }

    #[test]
    fn best_and_opaque_selectors_pass_through() {
        let best = resolve("best", &[], &[720]);
        assert_eq!(best.selector, "best");
        assert!(!best.downgraded);

        let opaque = resolve("worstvideo+worstaudio", &[], &[720]);
        assert_eq!(opaque.selector, "worstvideo+worstaudio");
        assert!(!opaque.downgraded);
    }

    #[test]
    fn concrete_format_ids_resolve_through_their_height() {
        let formats = vec![combined("22", 720), combined("18", 360)];
        assert_eq!(parse_requested("22", &formats), RequestedQuality::Height(720));

        let kept = resolve("22", &formats, &[720, 360]);
        assert_eq!(kept.selector, "22");
        assert!(!kept.downgraded);
    }

    #[test]
    fn height_filters_and_aliases_are_recognized() {
        assert_eq!(
            parse_requested("bestvideo[height<=1440]+bestaudio", &[]),
            RequestedQuality::Height(1440)
        );
        assert_eq!(parse_requested("4K", &[]), RequestedQuality::Height(2160));
        let alias = resolve("4k", &[], &[2160, 1080]);
        assert_eq!(
            alias.selector,
            "bestvideo[height<=2160]+bestaudio/best[height<=2160]"
        );
    }

    #[test]
    fn playlist_names_map_to_capped_selectors() {
        assert_eq!(
            playlist_selector("480p"),
            "bestvideo[height<=480]+bestaudio/best[height<=480]"
        );
        assert_eq!(playlist_selector("best"), "best");
        assert_eq!(playlist_selector("2160p"), "2160p");
    }

    #[test]
    fn tier_labels_name_the_top_rungs() {
        assert_eq!(tier_label(4320), "4320p (8K)");
        assert_eq!(tier_label(1440), "1440p (2K)");
        assert_eq!(tier_label(720), "720p");
    }
}
