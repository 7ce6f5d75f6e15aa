mod artifacts;
mod errors;
mod events;
mod intents;
mod jobs;
mod view;

pub use artifacts::{
    normalize_ratio, ratio_dims, ExampleArtifact, GeneratedArtifact, GenerationMode, UploadedFile,
    UploadedFileMeta, ALLOWED_RATIOS, DEFAULT_RATIO,
};
pub use errors::{BackendError, RoutedAction, SessionSignal};
pub use events::{EventPayload, EventWriter};
pub use intents::{parse_intent, UserIntent, INTENT_HELP};
pub use jobs::{GenerationJob, JobStatus, JobUpdate};
pub use view::{PrimaryAction, ViewState};
