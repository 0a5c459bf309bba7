pub mod format;
pub mod probe;
pub mod sniff;

pub use format::{ChunkFormat, ContainerFamily, RecoveryStrategy};
pub use probe::{FfprobeProbe, MediaInfo, MediaProbe, ProbeError, ProbeResult};
pub use sniff::{looks_like_playable_container, sniff, SignatureMatch};
