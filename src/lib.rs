//! # docket
//!
//! Transactions, sticky-error cursors and fluent request builders for
//! document databases.
//!
//! docket provides:
//! - Sessions and multi-document transactions, explicit or closure-scoped,
//!   with automatic retry of transient failures
//! - Cursors and change streams that defer an opening failure to the first
//!   time they are inspected
//! - Chainable find, aggregate, bulk, distinct and find-and-modify builders
//! - A MongoDB store (feature `mongodb`, on by default) and an in-memory
//!   store for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docket::prelude::*;
//! use docket::mongodb::MongoStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = OpContext::background();
//!     let store = MongoStore::from_uri("mongodb://localhost:27017/?replicaSet=rs0").await?;
//!     let client = Client::connect(store, &ctx).await?;
//!     let users = client.database("app").collection("users");
//!
//!     let tx = client.begin(&ctx).await?;
//!     users.insert_one(tx.context(), &doc! { "_id": "uid1" }).await?;
//!     users.insert_one(tx.context(), &doc! { "_id": "uid2" }).await?;
//!     tx.commit(&ctx).await?;
//!
//!     let mut cursor = users.find(&ctx, doc! {}).sort(["-_id"]).cursor().await;
//!     while cursor.next(&ctx).await {
//!         let user: Document = cursor.one()?;
//!         println!("{user}");
//!     }
//!     if let Some(err) = cursor.error() {
//!         return Err(err.clone().into());
//!     }
//!     cursor.close(&ctx).await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use docket_query::*;

/// The MongoDB store.
#[cfg(feature = "mongodb")]
#[cfg_attr(docsrs, doc(cfg(feature = "mongodb")))]
pub mod mongodb {
    pub use docket_mongodb::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use docket_query::prelude::*;

    #[cfg(feature = "mongodb")]
    pub use docket_mongodb::{MongoConfig, MongoStore};
}
