//! learnify-core: the types and wire format every Learnify crate shares,
//! plus configuration loading.

pub mod catalog;
pub mod config;
pub mod peer;
pub mod queue;
pub mod wire;

pub use catalog::{PeerInfo, ShareCatalogEntry, SharedVideo, Transcript, TranscriptSegment, VideoMeta};
pub use peer::Peer;
pub use queue::{
    DownloadProgress, DownloadStatus, NewDownload, QueueItem, QueueOrigin, TransferProgress,
    TransferStatus,
};
