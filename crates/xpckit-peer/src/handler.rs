use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use xpckit_object::{from_object, to_object, XpcObject};

use crate::connection::Connection;
use crate::error::XpcError;

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<XpcObject, XpcError>>;

/// Uniform shape every handler is adapted to at registration.
pub type Handler = Arc<dyn Fn(XpcObject, Connection) -> HandlerFuture + Send + Sync>;

/// Message name → handler mapping consulted on every inbound message.
///
/// One table is shared by a listener and every connection it accepts, so
/// handlers registered on the listener at any time are visible to all of
/// them. Registering a name again replaces the previous handler. Typed and
/// raw handlers see the same payload tree, so either kind may serve a name.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler.
    ///
    /// The payload is decoded into `Req` before the handler runs, and the
    /// returned `Resp` is encoded into the reply.
    pub fn handle<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, XpcError>> + Send + 'static,
    {
        self.handle_with_peer(name, move |request: Req, _peer: Connection| handler(request));
    }

    /// Register a typed handler that also receives the calling connection.
    pub fn handle_with_peer<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, XpcError>> + Send + 'static,
    {
        let adapted = move |payload: XpcObject, peer: Connection| -> HandlerFuture {
            let call = from_object::<Req>(payload).map(|request| handler(request, peer));
            Box::pin(async move {
                let response = call?.await?;
                Ok::<_, XpcError>(to_object(&response)?)
            })
        };
        self.insert(name.into(), Arc::new(adapted));
    }

    /// Register a handler that works on the object tree directly.
    pub fn handle_raw<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(XpcObject, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<XpcObject, XpcError>> + Send + 'static,
    {
        let adapted = move |payload: XpcObject, peer: Connection| -> HandlerFuture {
            Box::pin(handler(payload, peer))
        };
        self.insert(name.into(), Arc::new(adapted));
    }

    /// Remove the handler for `name`, returning whether one was registered.
    pub fn remove(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered message names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn insert(&self, name: String, handler: Handler) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handler)
            .is_some();
        debug!(message = %name, replaced, "registered handler");
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use xpckit_object::Dictionary;

    use super::*;

    #[derive(Deserialize)]
    struct Text {
        text: String,
    }

    #[derive(Serialize)]
    struct Upper {
        text: String,
    }

    fn request(text: &str) -> XpcObject {
        let mut dict = Dictionary::new();
        dict.set_string("text", text);
        XpcObject::Dictionary(dict)
    }

    #[tokio::test]
    async fn typed_handlers_decode_and_encode() {
        let table = HandlerTable::new();
        table.handle("upper", |req: Text| async move {
            Ok(Upper {
                text: req.text.to_uppercase(),
            })
        });

        let handler = table.get("upper").unwrap();
        let reply = handler(request("abc"), Connection::detached()).await.unwrap();
        assert_eq!(
            reply.as_dictionary().unwrap().get_string("text"),
            Some("ABC")
        );
    }

    #[tokio::test]
    async fn typed_handlers_report_decoding_mismatch() {
        let table = HandlerTable::new();
        table.handle("upper", |req: Text| async move { Ok(req.text) });

        let handler = table.get("upper").unwrap();
        let err = handler(XpcObject::Int64(3), Connection::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, XpcError::DecodingMismatch { .. }));
    }

    #[tokio::test]
    async fn last_registration_wins_across_typed_and_raw() {
        let table = HandlerTable::new();
        table.handle("echo", |req: Text| async move { Ok(req.text) });
        table.handle_raw("echo", |payload, _peer| async move { Ok(payload) });
        assert_eq!(table.names(), vec!["echo".to_string()]);

        let handler = table.get("echo").unwrap();
        let reply = handler(request("same tree"), Connection::detached())
            .await
            .unwrap();
        assert_eq!(reply, request("same tree"));

        assert!(table.remove("echo"));
        assert!(!table.contains("echo"));
        assert!(!table.remove("echo"));
    }
}
