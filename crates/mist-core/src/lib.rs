pub mod dialect;
pub mod error;
pub mod format;
pub mod gateway;
pub mod message;
pub mod schema;

pub use error::{CredentialError, Error, Result, SourceError, StoreError};
pub use gateway::{DatabaseGateway, DbValue, QueryRows, ValueType};
pub use message::{Identity, MessageRecord};
