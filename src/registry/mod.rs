//! Client of the tag listing API and the docker registry API
//!
//! The transport is abstracted by [HttpClient] so that the scanner can be
//! driven by canned responses in tests.

mod auth;
mod client;
mod http;

pub use auth::{AuthChallenge, Credentials};
pub use client::Client;
pub use http::{with_query, HttpClient, HttpResponse, UreqClient};
