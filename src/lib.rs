#![doc = include_str!("../README.md")]

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod envelope;
mod event;
pub mod forward;
pub mod inbound;

#[doc(inline)]
pub use envelope::{Envelope, MailInfo};

#[doc(inline)]
pub use event::EventKind;

#[doc(inline)]
pub use dispatch::{DispatchReport, Dispatcher, MailOutcome};

#[doc(inline)]
pub use forward::{ForwardError, ForwardErrorKind, Forwarder};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerRunError, ConsumerRunErrorKind, DefaultConsumerHook,
};
