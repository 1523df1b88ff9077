pub mod audit;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod migrate;
pub mod notify;
pub mod provision;
pub mod request;
pub mod runtime;
pub mod status;
pub mod store;
pub mod users;

pub use error::{ConflictField, RequestError, RequestResult};
pub use lifecycle::{ApprovalBackend, RequestServices, RequestSettings};
pub use request::{Comment, RequestDetails, RequestId, User, UserId, WikiRequest};
pub use status::{RequestStatus, transition};
