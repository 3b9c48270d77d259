//! # Jam Engine
//!
//! A schema-aware, versioned object store for clients of a JSON:API server.
//!
//! The store keeps server-owned objects in memory, records every local edit
//! as a reversible diff, and compacts those edits into a dependency-ordered
//! sequence of remote calls. Identifiers generated on the client are
//! reconciled with the ones the server assigns, so either key keeps naming
//! the same object.
//!
//! ## Core Concepts
//!
//! ### Schema and models
//!
//! A [`Schema`] holds one [`Model`] per type. Models declare attributes
//! (typed scalars) and relationships (foreign keys or many-to-many sets).
//! A relationship with a `relatedName` gets a synthesized reverse field on
//! its target, kept in step automatically.
//!
//! ### Branches and the diff log
//!
//! A [`Store`] has two [`Branch`]es. The *tail* is what the server is
//! believed to hold; the *head* is the working state. Edits go to the head
//! and are appended to the diff log. [`Store::commit`] turns the head/tail
//! difference into the minimal ordered set of [`Diff`]s, which are then sent
//! one at a time with [`Store::commit_diff`] and acknowledged with
//! [`Store::post_commit_diff`].
//!
//! ### Transactions and rebase
//!
//! [`Store::start_transaction`] opens a named branch staged against the
//! store; committing it replays its edits last-writer-wins. [`Store::rebase`]
//! replays one store's local edits onto another.
//!
//! ## Quick Start
//!
//! ```rust
//! use jam_engine::{Branch, Filter, Schema};
//! use serde_json::json;
//!
//! // 1. Describe the models
//! let schema = Schema::from_json(&json!({
//!     "movie": {
//!         "attributes": {"title": {"type": "text"}},
//!         "relationships": {"director": {"type": "person", "relatedName": "directed"}}
//!     },
//!     "person": {"attributes": {"name": {"type": "text"}}}
//! }))
//! .unwrap();
//!
//! // 2. Create a store and edit it
//! let mut store = schema.db();
//! store.create("person", &json!({"id": 1, "name": "Sylvester Stallone"})).unwrap();
//! let rocky = store
//!     .create("movie", &json!({"id": 1, "title": "Rocky", "director": 1}))
//!     .unwrap();
//! assert!(!store.exists(rocky.id(), Branch::Tail));
//!
//! // 3. Query the head
//! let hits = store.filter("movie", &Filter::eq("director__name", "Sylvester Stallone")).unwrap();
//! assert_eq!(hits.len(), 1);
//!
//! // 4. Compact edits for the server
//! assert_eq!(store.commit().unwrap(), 2);
//! assert_eq!(store.outgoing_diffs()[0].ty(), "person");
//! ```
//!
//! ## Persistence
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with
//! [`StoreSnapshot`]. Snapshots serialize to JSON with deterministic
//! ordering.

pub mod config;
pub mod diff;
pub mod error;
pub mod field;
pub mod filter;
pub mod id;
pub mod instance;
pub mod jsonapi;
pub mod model;
pub mod ops;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod table;
pub mod value;

// Re-export main types at crate root
pub use config::{ConfigError, ConflictPolicy, StoreConfig};
pub use diff::{Diff, DiffOp};
pub use error::{Error, Result};
pub use field::{AttributeType, FieldDiff, FieldKind};
pub use filter::Filter;
pub use id::{Id, IdArena, Key, ObjectRef};
pub use instance::Instance;
pub use jsonapi::Resource;
pub use model::{Attribute, EntityDescription, Model, Relationship};
pub use ops::{OpCall, OpFuture, OpHandler};
pub use record::Record;
pub use schema::Schema;
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Branch, Store};
pub use table::{Lookup, Table};
pub use value::{IndexKey, RefSet, Value};

/// Type aliases for clarity
pub type TypeName = String;
pub type FieldName = String;
