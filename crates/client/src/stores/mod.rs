//! Observable per-session stores fed by the shared connection.

pub mod cart;
pub mod lifecycle;
pub mod roster;

pub use cart::{CartState, ParticipantItems, SharedCart};
pub use lifecycle::{
    ArchiveAction, Clock, CountdownState, LifecycleNotice, LifecyclePhase, LifecycleState,
    ManualClock, SessionLifecycle, SystemClock,
};
pub use roster::{RosterState, SessionRoster};
