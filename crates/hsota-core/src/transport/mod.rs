//! Transport layer module.

pub mod http;
pub mod mock;
pub mod stream;
pub mod traits;

pub use http::HttpTransport;
pub use mock::{LiveFeed, MockNetwork};
pub use stream::ChannelStream;
pub use traits::{ByteStream, DownloadError, FetchError, ManifestFetcher, StreamingDownloader};
