pub mod error;
pub mod gateway;
pub mod registration;
pub mod verification;

pub use error::GatewayError;
pub use gateway::{router, AppState, Gateway};
pub use registration::RegistrationService;
pub use verification::PhoneVerificationService;
