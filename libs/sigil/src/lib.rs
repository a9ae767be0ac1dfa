//! Function-side runtime for ignite.
//!
//! A function binary registers one handler and serves it over
//! `FunctionRunnerService/Invoke`:
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     items: u32,
//! }
//!
//! #[derive(Serialize)]
//! struct Quote {
//!     total: u32,
//! }
//!
//! async fn quote(order: Order) -> Result<Quote, String> {
//!     Ok(Quote { total: order.items * 3 })
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tonic::transport::Error> {
//!     ignite_sigil::serve(quote, ignite_sigil::default_addr()).await
//! }
//! ```

pub mod handler;
pub mod server;

pub use handler::{Context, Function, Handler, HandlerError, InputKind, OutputKind, Signature};
pub use server::{default_addr, serve, serve_with_incoming, FunctionServer, DEFAULT_PORT};
