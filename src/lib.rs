//! # Event-driven networking over a fixed loop pool
//!
//! A connection reactor: instead of one thread (or task) per connection, a
//! small fixed pool of OS threads each runs a non-blocking poll loop over
//! the platform's readiness facility (epoll on Linux, kqueue on BSD and
//! Darwin). Connections are established through blocking-style connect and
//! accept calls, converted into reactor-owned non-blocking descriptors, and
//! assigned to one loop for their entire lifetime. The application observes
//! them through [`Handler`] callbacks.
//!
//! # Examples
//! __Echo client__
//! ```rust,no_run
//! use netloop::{Builder, Conn, Handler};
//! use std::io;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_open(&self, conn: &Conn) {
//!         conn.send(b"ping").unwrap();
//!     }
//!
//!     fn on_data(&self, conn: &Conn, data: &[u8]) -> usize {
//!         println!("{} replied with {} bytes", conn.remote_addr(), data.len());
//!         conn.close();
//!         data.len()
//!     }
//!
//!     fn on_close(&self, _conn: &Conn, err: Option<&io::Error>) {
//!         println!("closed: {:?}", err);
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
//!     let reactor = Builder::new().loops(2).build(Echo)?;
//!     reactor.dial("tcp://127.0.0.1:7000", ())?;
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     Ok(())
//! }
//! ```
//! __Echo server__
//! ```rust,no_run
//! use netloop::{Conn, Handler, Reactor};
//!
//! struct Server;
//!
//! impl Handler for Server {
//!     fn on_data(&self, conn: &Conn, data: &[u8]) -> usize {
//!         let _ = conn.send(data);
//!         data.len()
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
//!     let reactor = Reactor::new(Server)?;
//!     let listener = reactor.listen("tcp://127.0.0.1:7000", ())?;
//!     println!("listening on {}", listener.local_addr());
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```

#![warn(rust_2018_idioms, unreachable_pub, missing_debug_implementations)]

mod acquire;
mod addr;
mod conn;
mod error;
mod event_loop;
mod handler;
mod reactor;

pub mod sys;

pub use crate::addr::{Addr, Scheme};
pub use crate::conn::{Conn, State};
pub use crate::error::{Error, Result};
pub use crate::handler::Handler;
pub use crate::reactor::{Builder, Listener, Reactor};
