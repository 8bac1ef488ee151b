pub mod events;
pub mod session;
pub mod store;
pub mod summary;

pub use events::{EventPayload, EventWriter};
pub use session::{
    HistoryEntry, Page, RenderConfig, Session, SessionConfig, UploadedReference,
};
pub use store::{FileSessionStore, PersistenceError, SessionFieldsUpdate, SessionStore};
pub use summary::{write_batch_summary, BatchSummary};
