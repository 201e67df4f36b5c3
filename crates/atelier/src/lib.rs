//! Atelier is the resilient request layer of the atelier creative client.
//!
//! # Overview
//! Every call the client makes to its backends goes through this crate. It
//! provides:
//!
//! - Bearer-token injection with a single-flight token refresh
//! - Submission and polling of long-running feature jobs (image generation,
//!   upscaling, video, ...)
//! - An ordered session log whose job-backed replies resolve from one shared
//!   poll tick
//!
//! # Architecture
//! [`AuthGateway`] sits at the bottom and is shared behind an `Arc`.
//! [`TaskOrchestrator`] and [`SessionTaskTracker`] both send through it, so a
//! refresh triggered anywhere is picked up everywhere.

/// Bearer tokens and the single-flight refresh
pub mod auth;

/// Client configuration
pub mod config;

/// The `{code, message, result}` response wrapper
pub mod envelope;

/// Error types and handling
pub mod error;

/// User-facing error messages
pub mod friendly;

/// Typed parameters for each feature job
pub mod jobs;

pub mod outbound;

pub mod rate_limit;

pub mod request;

/// Conversational sessions
pub mod session;

/// Job submission and polling
pub mod task;

pub use auth::{AuthGateway, CredentialListener, Credentials, HttpTokenRefresher, TokenRefresher};
pub use config::ClientConfig;
pub use error::AtelierError;
pub use friendly::ErrorCategory;
pub use outbound::HttpTransport;
#[cfg(feature = "reqwest-client")]
pub use outbound::ReqwestTransport;
pub use request::ApiRequest;
pub use session::{HttpChatBackend, SessionBackend, SessionTaskTracker};
pub use task::{
    PollOptions, PollOutcome, StatusUpdate, Submission, Task, TaskKind, TaskOrchestrator,
    TaskStatus,
};
