use serde::{Deserialize, Serialize};

/// The four output quality rungs, in the fixed order the pipeline always
/// compresses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    P480,
    P360,
    P240,
    P144,
}

impl Quality {
    pub const ALL: [Quality; 4] = [Quality::P480, Quality::P360, Quality::P240, Quality::P144];

    pub fn tag(self) -> &'static str {
        match self {
            Quality::P480 => "480p",
            Quality::P360 => "360p",
            Quality::P240 => "240p",
            Quality::P144 => "144p",
        }
    }

    pub fn preset(self) -> QualityPreset {
        match self {
            Quality::P480 => QualityPreset {
                quality: self,
                target_height: 480,
                video_bitrate_kbps: 800,
                max_bitrate_kbps: 1200,
                crf: 23,
                hls_bandwidth: 1_300_000,
                codec_string: "avc1.4d001f,mp4a.40.2",
            },
            Quality::P360 => QualityPreset {
                quality: self,
                target_height: 360,
                video_bitrate_kbps: 500,
                max_bitrate_kbps: 750,
                crf: 23,
                hls_bandwidth: 850_000,
                codec_string: "avc1.4d001f,mp4a.40.2",
            },
            Quality::P240 => QualityPreset {
                quality: self,
                target_height: 240,
                video_bitrate_kbps: 300,
                max_bitrate_kbps: 450,
                crf: 22,
                hls_bandwidth: 550_000,
                codec_string: "avc1.4d0015,mp4a.40.2",
            },
            Quality::P144 => QualityPreset {
                quality: self,
                target_height: 144,
                video_bitrate_kbps: 150,
                max_bitrate_kbps: 225,
                crf: 21,
                hls_bandwidth: 325_000,
                codec_string: "avc1.4d000d,mp4a.40.2",
            },
        }
    }

    /// Ascending-resolution order, as the master playlist wants its variants.
    pub fn ascending() -> [Quality; 4] {
        [Quality::P144, Quality::P240, Quality::P360, Quality::P480]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPreset {
    pub quality: Quality,
    pub target_height: u32,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub crf: u8,
    pub hls_bandwidth: u64,
    pub codec_string: &'static str,
}

/// Width that preserves aspect ratio for a given target height, rounded to
/// the nearest even integer (libx264 refuses odd dimensions in 4:2:0).
pub fn scaled_width(source_width: u32, source_height: u32, target_height: u32) -> u32 {
    if source_height == 0 {
        return target_height;
    }
    let raw = (source_width as f64) * (target_height as f64) / (source_height as f64);
    let rounded = raw.round() as u32;
    if rounded % 2 == 0 {
        rounded
    } else {
        rounded + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn all_presets_have_expected_crf_table() {
        assert_eq!(Quality::P480.preset().crf, 23);
        assert_eq!(Quality::P360.preset().crf, 23);
        assert_eq!(Quality::P240.preset().crf, 22);
        assert_eq!(Quality::P144.preset().crf, 21);
    }

    #[test]
    fn ascending_order_is_smallest_first() {
        let order = Quality::ascending();
        assert_eq!(order[0], Quality::P144);
        assert_eq!(order[3], Quality::P480);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn scaled_width_is_always_even(
            sw in 16_u32..8000,
            sh in 16_u32..8000,
            target in prop::sample::select(vec![480u32, 360, 240, 144]),
        ) {
            let w = scaled_width(sw, sh, target);
            prop_assert_eq!(w % 2, 0);
            prop_assert!(w > 0);
        }
    }
}
