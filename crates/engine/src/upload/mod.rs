//! Upload lifecycle.
//!
//! [`UploadQueue`] owns every in-flight and recently finished upload as an
//! ephemeral [`UploadTask`]. Collection reloads never read or clear it.

pub mod queue;
pub mod task;

pub use queue::{UploadError, UploadEvent, UploadQueue, UploadSummary};
pub use task::{UploadFile, UploadStatus, UploadTask};
