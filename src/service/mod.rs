//! # Connection Service
//!
//! The caller-facing side of the crate: [`Connection`] issues operations,
//! [`ResponseStream`] and [`PendingResponse`] collect their responses, and
//! [`EventPoller`] fans a long-lived search out to listeners.

pub mod connection;
pub mod poller;
pub mod response;

pub use connection::{Connection, ConnectionState, SearchResults};
pub use poller::{EventPoller, PollEvent, Subscription};
pub use response::{FragmentPoll, PendingResponse, ResponseStream};
