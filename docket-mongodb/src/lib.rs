//! # docket-mongodb
//!
//! MongoDB document store for docket.
//!
//! [`MongoStore`] implements [`docket_query::DocumentStore`] on top of the
//! official `mongodb` driver. Each request maps onto the driver's typed
//! collection call; a context bound to a docket session uses the
//! `*_with_session` form on that session's `ClientSession`, which is what
//! places the operation inside a transaction. Cursors and change streams
//! opened in a session keep iterating on it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use docket_mongodb::{MongoConfig, MongoStore};
//! use docket_query::{Client, OpContext, doc};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoConfig::builder()
//!     .uri("mongodb://localhost:27017/?replicaSet=rs0")
//!     .app_name("billing")
//!     .build()?;
//! let store = MongoStore::new(config).await?;
//!
//! let ctx = OpContext::background();
//! let client = Client::connect(store, &ctx).await?;
//! let accounts = client.database("billing").collection("accounts");
//!
//! client
//!     .with_transaction(&ctx, |tx| {
//!         let accounts = accounts.clone();
//!         async move {
//!             accounts.insert_one(&tx, &doc! { "_id": "acct-1", "balance": 0 }).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`MongoConfig::from_env`] reads `DOCKET_MONGODB_URI` and, when set,
//! `DOCKET_MONGODB_APP_NAME`.

pub mod client;
pub mod config;
mod convert;
mod cursor;
pub mod error;
pub mod session;

pub use client::MongoStore;
pub use config::{APP_NAME_ENV, MongoConfig, MongoConfigBuilder, ReadPreference, URI_ENV};
pub use cursor::OPEN_CURSOR_ID;
pub use error::{
    MongoError, MongoResult, NAMESPACE_NOT_FOUND_SERVER_CODE, NO_SUCH_TRANSACTION_SERVER_CODE,
};
pub use session::MongoSession;

// Re-export the driver for direct access
pub use mongodb;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::client::MongoStore;
    pub use crate::config::{MongoConfig, MongoConfigBuilder, ReadPreference};
    pub use crate::error::{MongoError, MongoResult};
    pub use docket_query::prelude::*;
}
