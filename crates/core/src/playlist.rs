use crate::presets::Quality;

/// One successfully-segmented variant, with resolution re-derived from the
/// actual encoded file rather than the preset (a transcode can legitimately
/// produce a slightly different height than requested).
#[derive(Debug, Clone)]
pub struct Variant {
    pub quality: Quality,
    pub width: u32,
    pub height: u32,
}

/// Builds the `#EXT-X-STREAM-INF` master playlist listing every variant that
/// made it through segmentation, ascending by resolution.
pub fn build_master_playlist(mut variants: Vec<Variant>) -> String {
    variants.sort_by_key(|v| v.height);

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");

    for variant in &variants {
        let preset = variant.quality.preset();
        let bandwidth = preset.hls_bandwidth;
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\",NAME=\"{}\"\n",
            bandwidth,
            bandwidth,
            variant.width,
            variant.height,
            preset.codec_string,
            variant.quality.tag(),
        ));
        out.push_str(&format!("{}.m3u8\n", variant.quality.tag()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_are_ordered_ascending_by_resolution() {
        let playlist = build_master_playlist(
            vec![
                Variant { quality: Quality::P480, width: 854, height: 480 },
                Variant { quality: Quality::P144, width: 256, height: 144 },
                Variant { quality: Quality::P360, width: 640, height: 360 },
            ],
        );

        let p144_pos = playlist.find("144p.m3u8").unwrap();
        let p360_pos = playlist.find("360p.m3u8").unwrap();
        let p480_pos = playlist.find("480p.m3u8").unwrap();
        assert!(p144_pos < p360_pos);
        assert!(p360_pos < p480_pos);
    }

    #[test]
    fn missing_variant_is_simply_absent() {
        let playlist = build_master_playlist(
            vec![Variant { quality: Quality::P480, width: 854, height: 480 }],
        );
        assert!(!playlist.contains("144p.m3u8"));
        assert!(playlist.contains("480p.m3u8"));
    }

    #[test]
    fn header_lines_are_present() {
        let playlist = build_master_playlist(vec![]);
        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
    }
}
