//! Remote operations.
//!
//! The store never talks to the network itself. Each model carries a table of
//! named handlers; [`crate::Store::commit_diff`] picks the right one, calls
//! it with the rendered payload and hands the resulting future back to the
//! caller.

use crate::error::Result;
use crate::id::Key;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a remote operation.
pub type OpFuture = BoxFuture<'static, Result<Json>>;

/// A registered remote operation.
pub type OpHandler = Arc<dyn Fn(OpCall) -> OpFuture + Send + Sync>;

/// Arguments of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct OpCall {
    /// Server identifier of the subject; absent for `create`.
    pub id: Option<Key>,
    /// JSON:API body; absent for `remove`.
    pub body: Option<Json>,
}

/// Wrap an async function as an [`OpHandler`].
pub fn handler<F, Fut>(f: F) -> OpHandler
where
    F: Fn(OpCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Json>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

/// Named handlers of one model.
#[derive(Clone, Default)]
pub struct Operations {
    handlers: BTreeMap<String, OpHandler>,
}

impl Operations {
    pub(crate) fn insert(&mut self, name: String, handler: OpHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<&OpHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn handler_runs_async_fn() {
        let op = handler(|call: OpCall| async move {
            Ok(json!({"id": call.id.map(|k| k.to_json())}))
        });
        let response = op(OpCall {
            id: Some(Key::from(7)),
            body: None,
        })
        .await
        .unwrap();
        assert_eq!(response, json!({"id": 7}));
    }

    #[test]
    fn debug_lists_names() {
        let mut ops = Operations::default();
        ops.insert("create".into(), handler(|_| async { Ok(Json::Null) }));
        assert_eq!(format!("{:?}", ops), r#"{"create"}"#);
        assert!(ops.contains("create"));
        assert_eq!(ops.names().collect::<Vec<_>>(), vec!["create"]);
    }
}
