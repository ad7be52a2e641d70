//! Transport abstractions, wire framing and metrics for the Hypha neural handshake.
//!
//! Nothing in here knows about connection lifecycles or peers beyond their
//! node ids; the protocol state machine lives in `hypha-core`.

pub mod traits;
pub mod framing;
pub mod connection;
pub mod backpressure;
pub mod metrics;
pub mod tcp;
pub mod testing;

pub use traits::*;
pub use framing::*;
pub use connection::*;
pub use backpressure::*;
pub use metrics::*;
pub use tcp::*;
pub use testing::*;
