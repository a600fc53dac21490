mod assembler;
mod encoder;
mod error;
mod recorder;

pub use assembler::{expected_duration, order_frames, VideoArtifact, VideoAssembler};
pub use encoder::{EncodeRequest, FfmpegEncoder, FrameEncoder};
pub use error::{MediaError, MediaResult};
pub use recorder::{
    city_slug, prune_sessions, session_directory_name, CheckpointLabel, Screenshot,
    ScreenshotRecorder, ScreenshotValidation,
};
