//! `stockroom-core` — shared building blocks.
//!
//! Identifiers, the error model and the injectable clock used by the
//! permission cache and the realtime dispatcher. No IO lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BusinessUnitId, UserId};
