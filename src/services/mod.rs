//! Services module for tenancy, callbacks and outbound dispatch

pub mod callback_correlator;
pub mod callback_payloads;
pub mod credentials;
pub mod request_dispatcher;
pub mod tenancy;

pub use callback_correlator::{CallbackAck, CallbackCorrelator, CallbackError, CallbackKind};
pub use credentials::{CredentialStore, InMemoryCredentialStore};
pub use request_dispatcher::{DispatchOutcome, DispatchResult, RequestDispatcher};
pub use tenancy::{Business, Caller, TenancyError, TenancyResolver, TenancyStore};
