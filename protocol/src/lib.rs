//! Wire types shared by the brand-audit client and CLI.
//!
//! [`http`] holds the request/response bodies of the analysis REST API and
//! [`stream`] the JSON frames exchanged over the job progress stream.

pub mod http;
pub mod stream;

pub use http::AnalyzeRequest;
pub use http::AnalyzeResponse;
pub use http::HealthResponse;
pub use http::JobStatus;
pub use http::StatusResponse;
pub use stream::ClientMessage;
pub use stream::ConnectedInfo;
pub use stream::ProgressUpdate;
pub use stream::ServerMessage;
pub use stream::StageInfo;
