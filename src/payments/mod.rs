//! Outbound Daraja integration

pub mod error;
pub mod provider;
pub mod providers;
pub mod requests;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use provider::DarajaGateway;
pub use providers::mpesa::{AccessTokenCache, DarajaClient};
pub use requests::CallbackUrls;
pub use types::{DarajaCredential, DarajaEndpoint, Environment, MpesaShortcode, VendorResponse};
