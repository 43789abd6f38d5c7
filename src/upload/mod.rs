//! Chunked uploads.
//!
//! [`session::UploadSession`] is the state of one in-progress upload and
//! [`manager::UploadSessionManager`] drives sessions from the first chunk
//! to a registered object.

pub mod manager;
pub mod session;
