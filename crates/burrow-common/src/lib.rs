mod error;
mod secret;
mod tls;

pub use error::CommonError;
pub use secret::SecretRef;
pub use tls::{load_console_tls_config, tls_acceptor_from_pem};
