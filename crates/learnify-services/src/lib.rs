//! learnify-services holds the networked half of Learnify. Discovery, the
//! peer transfer server and client, and the desktop client feed the
//! download manager.

pub mod client;
pub mod connection;
pub mod desktop;
pub mod discovery;
pub mod downloads;
pub mod error;
pub mod fetch;
pub mod library;
pub mod queue;
pub mod server;
pub mod sharing;
pub mod store;

pub use client::TransferClient;
pub use connection::{ServerConnection, SessionSource};
pub use desktop::DesktopClient;
pub use discovery::multicast::{MulticastConfig, MulticastTransport};
pub use discovery::presence::PresencePublisher;
pub use discovery::{AdvertTransport, Discovery, ScanEvent};
pub use downloads::{DownloadManager, QueueEvent};
pub use error::{
    DiscoveryError, DownloadError, ErrorKind, ServerError, SharingError, TransferError,
};
pub use fetch::{FetchedVideo, NetworkFetcher, TransferSource, VideoFetcher};
pub use library::{FsLibrary, LibrarySink};
pub use server::TransferServer;
pub use sharing::{SharingMode, SharingSession};
pub use store::{FileStore, KeyValueStore, MemoryStore};
