//! Session Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Call Sessions (Media Source + Peer Links eines Anrufs)
//! - Aggregation der Link-Zustände zum Session-Status
//! - Den Manager, der höchstens eine laufende Session zulässt

mod call;
mod manager;
mod record;
mod state;

pub use call::CallSession;
pub use manager::{CallSessionManager, ManagerEvent};
pub use record::CallRecord;
pub use state::{
    CallDirection, CallError, EndReason, Participant, SessionEvent, SessionState,
};
