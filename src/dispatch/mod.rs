//! Batched lookup dispatch
//!
//! One call walks a fixed sequence of asynchronous submissions and ends at
//! a single join point:
//!
//! ```text
//! Idle ─push indices─▶ IndicesSent ─push offsets─▶ OffsetsSent
//!      ─push lengths─▶ LengthsSent ─launch─▶ Launched
//!      ─pull results─▶ Gathering ─sync─▶ Done
//! ```
//!
//! There is no partial retry: a failed call must be redone from `Idle`.

pub mod dispatcher;
pub mod stats;

pub use dispatcher::{DispatchState, LookupDispatcher};
pub use stats::{LookupStats, Phase};
