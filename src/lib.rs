/// NES native resolution
pub const NES_WIDTH: u32 = 256;
pub const NES_HEIGHT: u32 = 240;

/// Observation size: native resolution scaled by 3/16 on each axis
pub const OBS_WIDTH: u32 = 48;
pub const OBS_HEIGHT: u32 = 45;
pub const OBS_DIM: usize = (OBS_WIDTH * OBS_HEIGHT) as usize;

/// Grayscale intensities at or below this are treated as background
pub const DARK_THRESHOLD: u8 = 40;

pub mod classes;
pub mod command;
pub mod debounce;
pub mod emulator;
pub mod extract;
pub mod frame;
pub mod link;
pub mod model;
pub mod play;
pub mod screen;
pub mod stage;
pub mod training;
pub mod video;

pub use classes::{ClassTable, SpriteConfig};
pub use command::{Button, CommandCodec, CommandSet, Facing};
pub use debounce::{ActionDebouncer, RepetitionCounter};
pub use emulator::{CancelToken, EmulatorConfig, EmulatorProcess, ExitOutcome, Liveness};
pub use extract::{LabelTrack, Recognition, StateRecognizer, Transition, TransitionExtractor};
pub use frame::{Frame, Observation, RollingWindow};
pub use link::{ConnectPolicy, ConnectionState, EmulatorLink, FrameLink, FramePoll, LinkError, LinkStatus};
pub use model::{ClassifierConfig, FitHistory, FrameClassifier, Model};
pub use play::{EndReason, PlayConfig, PlayLoop, PlayOutcome, run_session};
pub use screen::{Headless, Screen, Window};
pub use stage::{Stage, StageError, StageSelect};
pub use training::{
    EpochExtension, FitRecord, NoExtension, ProgressSnapshot, ProgressTracker, StdinPrompt,
    TrainConfig, TrainingController, TrainingLog,
};
pub use video::{FfmpegVideo, VideoSource};
