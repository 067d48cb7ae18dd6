pub mod context;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod message;
pub mod queue;
pub mod record;
pub mod service;
pub mod storage;

pub use context::{Clock, Context, FixedClock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
pub use entity::{Entity, Key};
pub use error::{Error, ErrorKind};
pub use message::Message;
pub use queue::{Acker, Publisher, Republisher};
pub use record::{EventHeader, Mandate, Metadata, Record};
pub use service::Service;
pub use storage::{Downloader, Repository, Uploader};
