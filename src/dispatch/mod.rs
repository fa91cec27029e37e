//! Connection dispatchers.
//!
//! * [`Reactor`]: one thread, readiness callbacks over `poll(2)`.
//! * [`Proactor`]: one acceptor thread plus one supervised worker per connection.

pub mod proactor;
pub mod reactor;

pub use proactor::Proactor;
pub use reactor::Reactor;
