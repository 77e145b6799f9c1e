//! Client-side engines: control channel, session state machine, media
//! pipelines, stats/adaptation and the congestion-controlled file transport.

pub mod audio_receiver;
pub mod audio_sender;
pub mod control;
pub mod events;
pub mod file_transfer;
pub mod media;
pub mod session;
pub mod stats;
pub mod video_receiver;
pub mod video_sender;

pub use control::{ControlChannel, ControlError};
pub use events::{ClientEvent, EventBus};
pub use file_transfer::{FileReceiver, FileSender};
pub use session::{ClientSession, MediaBindings, SessionHandle, SessionState};
pub use stats::{StatsCollector, StatsSnapshot};
