//! Core event loop, load balancer and TCP connector for a single-threaded
//! reverse proxy.
//!
//! The pieces compose roughly bottom-up: [`time`] and [`token`] are leaf
//! utilities; [`fd`] is the fd-indexed registry every [`poller`] back-end
//! dispatches through; [`interest`] describes what a registration wants;
//! [`listener`] and [`connector`] create and configure the raw sockets that
//! get registered; [`buffer`] holds session data; [`stream_interface`] and
//! [`session`] model one client connection; [`lb`] picks a server for it;
//! [`proxy`] runs the per-listener admission and lifecycle bookkeeping that
//! ties the rest together. [`error`] is the shared error taxonomy used
//! throughout.

#[macro_use]
mod macros;

pub mod buffer;
pub mod connector;
pub mod error;
pub mod fd;
pub mod interest;
pub mod lb;
pub mod listener;
pub mod proxy;
pub mod session;
pub mod stream_interface;
pub mod time;
pub mod token;

pub mod poller;
