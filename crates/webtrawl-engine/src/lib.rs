//! Recursive fetch engine for webtrawl.
//!
//! The moving parts, roughly in data-flow order: the [`frontier`] is the
//! durable URL queue; the [`pipeline`] pulls claimed items through the
//! [`processor`], which runs an HTTP [`session`] or an [`ftp`] session;
//! sessions consult the [`fetch_rule`], the [`robots`] cache, and the
//! [`result_rule`], write documents through the [`writer`] (and
//! optionally [`warc`]), and feed discovered links from [`scrape`] back
//! into the frontier. The [`app`] module owns the run loop and exit
//! code; [`hooks`] is the callback surface for embedders.

pub mod app;
pub mod client;
pub mod fetch_rule;
pub mod frontier;
pub mod ftp;
pub mod hooks;
pub mod item;
pub mod pipeline;
pub mod processor;
pub mod result_rule;
pub mod robots;
pub mod scrape;
pub mod session;
pub mod stats;
pub mod waiter;
pub mod warc;
pub mod writer;

pub use app::{AppState, Application};
pub use frontier::Frontier;
pub use item::UrlItem;
pub use processor::Processor;
pub use session::{SessionConfig, SessionContext};
