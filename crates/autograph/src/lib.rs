pub mod authorize;
pub mod chainstore;
pub mod config;
pub mod error;
pub mod formats;
pub mod handlers;
pub mod hawk;
pub mod nonce;
pub mod server;
pub mod signing;

pub use config::Config;
pub use error::ApiError;
pub use hawk::{build_authorization_header, AuthError, RequestInfo};
pub use server::{build_state, router, run, AppState};
pub use signing::{AnySigner, DataSigner, FileSigner, HashSigner};
