//! Handlers and handler sets.
//!
//! A [`Handler`] binds an [`ActivationRule`] to an action. Actions are plain
//! closures or async functions taking the decoded message and the
//! connection's [`ConnectionState`]; whatever they return is converted into a
//! reply through [`IntoReply`].
//!
//! ```rust,ignore
//! use pulse_core::{on, Handler, HandlerSet};
//! use serde_json::json;
//!
//! let handlers: HandlerSet<Table> = HandlerSet::new(vec![
//!     // Immediate reply
//!     on(["type"], "ping").reply(|_msg, _state| json!({ "type": "pong" })),
//!
//!     // Long-running action
//!     on(["type"], "your_turn").name("play").action(|_msg, state: ConnectionState<Table>| async move {
//!         let card = state.wait_until(POLL, |t| t.hand.pop()).await;
//!         json!({ "type": "play", "card": card })
//!     }),
//! ]);
//! ```
//!
//! Handlers are immutable and cheap to clone. The same handler is invoked by
//! many connections at once; an action must not assume exclusive access to
//! anything but the state it is given.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::error::{HandlerError, HandlerResult, RuleResult};
use crate::rule::{ActivationRule, validate_message};
use crate::state::ConnectionState;

/// A type alias for a boxed, pinned future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A decoded inbound message, shared between the worker and the action.
pub type Message = Arc<Value>;

type ActionFn<S> = dyn Fn(Message, ConnectionState<S>) -> BoxFuture<'static, HandlerResult>
    + Send
    + Sync;

// ============================================================================
// Replies
// ============================================================================

/// A payload produced by an action, to be sent back on the same connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A JSON value, serialized before sending.
    Json(Value),
    /// Raw text, sent as-is.
    Text(String),
}

impl Reply {
    /// Whether this reply carries nothing worth sending.
    ///
    /// `null`, `{}` and `""` count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Json(Value::Null) => true,
            Self::Json(Value::Object(map)) => map.is_empty(),
            Self::Json(_) => false,
            Self::Text(text) => text.is_empty(),
        }
    }

    /// Serializes the reply into a text frame.
    pub fn encode(&self) -> Result<String, HandlerError> {
        match self {
            Self::Json(value) => {
                serde_json::to_string(value).map_err(|e| HandlerError::Encode(e.to_string()))
            }
            Self::Text(text) => Ok(text.clone()),
        }
    }
}

/// Conversion from an action's return value into a [`HandlerResult`].
pub trait IntoReply {
    /// Performs the conversion.
    fn into_reply(self) -> HandlerResult;
}

impl IntoReply for () {
    fn into_reply(self) -> HandlerResult {
        Ok(None)
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(self))
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(Reply::Json(self)))
    }
}

impl IntoReply for String {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(Reply::Text(self)))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(Reply::Text(self.to_owned())))
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> HandlerResult {
        match self {
            Some(inner) => inner.into_reply(),
            None => Ok(None),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: fmt::Display,
{
    fn into_reply(self) -> HandlerResult {
        match self {
            Ok(inner) => inner.into_reply(),
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

struct HandlerInner<S> {
    name: String,
    rule: ActivationRule,
    action: Box<ActionFn<S>>,
}

/// An activation rule bound to an action.
pub struct Handler<S> {
    inner: Arc<HandlerInner<S>>,
}

impl<S: Send + 'static> Handler<S> {
    /// Creates a handler named after its rule.
    pub fn new<F, Fut, R>(rule: ActivationRule, action: F) -> Self
    where
        F: Fn(Message, ConnectionState<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReply,
    {
        let name = rule.to_string();
        Self::named(name, rule, action)
    }

    /// Creates a handler with an explicit name used in diagnostics.
    pub fn named<F, Fut, R>(name: impl Into<String>, rule: ActivationRule, action: F) -> Self
    where
        F: Fn(Message, ConnectionState<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReply,
    {
        let action: Box<ActionFn<S>> = Box::new(
            move |message: Message, state: ConnectionState<S>| -> BoxFuture<'static, HandlerResult> {
                let fut = action(message, state);
                Box::pin(async move { fut.await.into_reply() })
            },
        );

        Self {
            inner: Arc::new(HandlerInner {
                name: name.into(),
                rule,
                action,
            }),
        }
    }
}

impl<S> Handler<S> {
    /// The handler's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The activation rule.
    pub fn rule(&self) -> &ActivationRule {
        &self.inner.rule
    }

    /// Whether `message` activates this handler.
    pub fn is_triggered(&self, message: &Value) -> RuleResult<bool> {
        self.inner.rule.matches(message)
    }

    /// Runs the action.
    ///
    /// The returned future is independent of `self` and can be spawned.
    pub fn run(
        &self,
        message: Message,
        state: ConnectionState<S>,
    ) -> BoxFuture<'static, HandlerResult> {
        (self.inner.action)(message, state)
    }
}

impl<S> Clone for Handler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Handler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.inner.name)
            .field("rule", &self.inner.rule)
            .finish()
    }
}

/// Starts building a handler for `path == expected`.
pub fn on<P, K>(path: P, expected: impl Into<Value>) -> HandlerBuilder
where
    P: IntoIterator<Item = K>,
    K: Into<String>,
{
    HandlerBuilder {
        rule: ActivationRule::new(path, expected),
        name: None,
    }
}

/// Builder returned by [`on`].
#[derive(Debug, Clone)]
pub struct HandlerBuilder {
    rule: ActivationRule,
    name: Option<String>,
}

impl HandlerBuilder {
    /// Sets the handler name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Finishes with an async action.
    pub fn action<S, F, Fut, R>(self, action: F) -> Handler<S>
    where
        S: Send + 'static,
        F: Fn(Message, ConnectionState<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReply,
    {
        match self.name {
            Some(name) => Handler::named(name, self.rule, action),
            None => Handler::new(self.rule, action),
        }
    }

    /// Finishes with an action that replies immediately.
    pub fn reply<S, F, R>(self, reply: F) -> Handler<S>
    where
        S: Send + 'static,
        F: Fn(Message, ConnectionState<S>) -> R + Send + Sync + 'static,
        R: IntoReply + Send + 'static,
    {
        self.action(move |message, state| std::future::ready(reply(message, state)))
    }
}

// ============================================================================
// Handler Set
// ============================================================================

/// An ordered, immutable collection of handlers.
///
/// Registration order is the tie-break order: [`HandlerSet::select`] returns
/// the first handler whose rule matches, and no other.
pub struct HandlerSet<S> {
    handlers: Arc<[Handler<S>]>,
}

impl<S> HandlerSet<S> {
    /// Creates a set from handlers in registration order.
    pub fn new(handlers: Vec<Handler<S>>) -> Self {
        Self {
            handlers: handlers.into(),
        }
    }

    /// Returns the first handler triggered by `message`.
    ///
    /// Fails with [`RuleError::InvalidInput`](crate::RuleError::InvalidInput)
    /// for an empty or non-object message, even when the set is empty.
    pub fn select(&self, message: &Value) -> RuleResult<Option<&Handler<S>>> {
        validate_message(message)?;

        for (index, handler) in self.handlers.iter().enumerate() {
            if handler.is_triggered(message)? {
                trace!(handler = handler.name(), index, "Handler rule matched");
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Iterates handlers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Handler<S>> {
        self.handlers.iter()
    }
}

impl<S> Clone for HandlerSet<S> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<S> Default for HandlerSet<S> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<S> FromIterator<Handler<S>> for HandlerSet<S> {
    fn from_iter<I: IntoIterator<Item = Handler<S>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<S> fmt::Debug for HandlerSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}
