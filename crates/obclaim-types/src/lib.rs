//! Shared types for the open banking claim workspace.
//!
//! Every crate in the workspace speaks in terms of these types: the push
//! channel produces [`ChannelFrame`]s, the authorization launcher consumes a
//! [`PaymentIntent`], the proof preparer turns a [`PaymentReceipt`] into
//! [`ProofInputs`] and the orchestrator reports progress as [`FlowEvent`]s.

pub mod amount;
pub mod authorization;
pub mod channel;
pub mod events;
pub mod ledger;
pub mod proof;
pub mod session;

pub use amount::*;
pub use authorization::*;
pub use channel::*;
pub use events::*;
pub use ledger::*;
pub use proof::*;
pub use session::*;
