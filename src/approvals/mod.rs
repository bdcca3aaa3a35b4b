//! Human approval of drafted replies.

pub mod queue;
pub mod routes;

pub use queue::ApprovalQueue;
pub use routes::approval_routes;
