pub mod config;
pub mod error;
pub mod executor;
pub mod ffmpeg;
pub mod media;
pub mod merge;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod validator;
pub mod waiter;

pub use config::{
    load_recmux_config, EncoderSection, ExecutorSection, MergeSection, PathsSection, RecmuxConfig,
    ValidationSection, WaiterSection,
};
pub use error::{ConfigError, Result};
pub use executor::{
    EncoderBackend, EncoderJob, EncoderOutput, EncoderProgress, ExecutorError, ExecutorResult,
    JobExecutor, JobId, JobState, JobSummary, SystemEncoderBackend,
};
pub use media::{
    ChunkFormat, ContainerFamily, FfprobeProbe, MediaInfo, MediaProbe, ProbeError, RecoveryStrategy,
};
pub use merge::{
    ChunkInput, ChunkIssue, DurationAccuracy, MergeEngine, MergeError, MergeMethod, MergeReport,
    MergeRequest, MergeResult,
};
pub use recovery::{ChunkRecoverer, RecoveryError, RecoveryOutcome, RecoveryScope};
pub use session::{
    ArtifactSink, ChunkReceipt, FailureKind, NewSession, SessionError, SessionMirror,
    SessionRegistry, SessionResult, SessionSnapshot, SessionStatus, SinkError,
    SqliteSessionStore,
};
pub use storage::{ChunkStorage, FsChunkStorage, StorageError, StoredChunk};
pub use validator::{ChunkValidator, ValidationResult};
pub use waiter::{ChunkWaiter, WaitOutcome};
