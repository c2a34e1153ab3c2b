use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states a job can be in. `Stalled` is never persisted on its own;
/// the broker reverts a stalled job straight to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Downloading,
    Validating,
    CompressingP480,
    CompressingP360,
    CompressingP240,
    CompressingP144,
    HlsConversion,
    ThumbnailCompression,
    Complete,
}

impl Stage {
    pub fn tag(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Downloading => "downloading",
            Stage::Validating => "validating",
            Stage::CompressingP480 => "compressing_480p",
            Stage::CompressingP360 => "compressing_360p",
            Stage::CompressingP240 => "compressing_240p",
            Stage::CompressingP144 => "compressing_144p",
            Stage::HlsConversion => "hls_conversion",
            Stage::ThumbnailCompression => "thumbnail_compression",
            Stage::Complete => "complete",
        }
    }
}

/// The submission payload accepted by the intake API, carried unchanged
/// through the job's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub post_id: u64,
    pub wp_media_path: String,
    pub wp_video_url: Option<String>,
    pub wp_thumbnail_path: Option<String>,
    pub wp_thumbnail_url: Option<String>,
    pub wp_post_url: Option<String>,
    pub year: u32,
    pub month: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityStats {
    pub quality: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_480p_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_360p_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_240p_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_144p_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_thumbnail_webp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_master_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_480p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_360p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_240p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_144p: Option<String>,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub duration: f64,
    pub processing_time: f64,
    pub qualities: Vec<QualityStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub submission: Submission,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub state: JobState,
    pub stage: Stage,
    pub progress: f64,
    pub attempt: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Deterministic job identity: `job_<postId>_<unixMillis>`. Used both as the
/// broker key and as the dedup key for the uniqueness invariant.
pub fn job_identity(post_id: u64, unix_millis: i64) -> String {
    format!("job_{}_{}", post_id, unix_millis)
}

pub fn new_job(submission: Submission, unix_millis: i64) -> Job {
    let now = Utc::now();
    Job {
        id: job_identity(submission.post_id, unix_millis),
        submission,
        created_at: now,
        updated_at: now,
        state: JobState::Pending,
        stage: Stage::Queued,
        progress: 0.0,
        attempt: 0,
        result: None,
        error: None,
        error_code: None,
    }
}

impl Job {
    /// Advance to a new stage/progress pair. Progress must never regress
    /// within an attempt; callers that violate this get clamped, not panicked,
    /// since a late-arriving transcoder progress line is not a bug worth
    /// crashing the worker over.
    pub fn advance(&mut self, stage: Stage, progress: f64) {
        self.stage = stage;
        self.progress = progress.max(self.progress).clamp(0.0, 100.0);
        self.updated_at = Utc::now();
    }

    pub fn mark_processing(&mut self) {
        self.state = JobState::Processing;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, result: ResultRecord) {
        self.state = JobState::Completed;
        self.stage = Stage::Complete;
        self.progress = 100.0;
        self.result = Some(result);
        self.error = None;
        self.error_code = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String, error_code: &str) {
        self.state = JobState::Failed;
        self.error = Some(error);
        self.error_code = Some(error_code.to_string());
        self.updated_at = Utc::now();
    }

    pub fn mark_delayed(&mut self, error: String, error_code: &str) {
        self.state = JobState::Delayed;
        self.error = Some(error);
        self.error_code = Some(error_code.to_string());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_submission(post_id: u64) -> Submission {
        Submission {
            post_id,
            wp_media_path: "/wp-content/uploads/2025/01/clip.mp4".to_string(),
            wp_video_url: None,
            wp_thumbnail_path: None,
            wp_thumbnail_url: None,
            wp_post_url: None,
            year: 2025,
            month: 1,
        }
    }

    #[test]
    fn identity_is_deterministic_and_matches_format() {
        let id = job_identity(42, 1_700_000_000_000);
        assert_eq!(id, "job_42_1700000000000");
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = new_job(sample_submission(7), 1_700_000_000_000);
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.state, JobState::Pending);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Progress reported out of order within a single attempt never
        /// regresses the job's recorded progress.
        #[test]
        fn advance_never_regresses_progress(
            first in 0.0_f64..100.0,
            second in 0.0_f64..100.0,
        ) {
            let mut job = new_job(sample_submission(1), 0);
            job.advance(Stage::Validating, first);
            let after_first = job.progress;
            job.advance(Stage::CompressingP480, second);
            prop_assert!(job.progress >= after_first);
        }
    }
}
