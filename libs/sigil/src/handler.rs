//! Typed handler adapter.
//!
//! A handler is any async function of one of three shapes:
//!
//! | Shape                            | Input kind       |
//! |----------------------------------|------------------|
//! | `async fn() -> O`                | `None`           |
//! | `async fn(In) -> O`              | `Payload`        |
//! | `async fn(Context, In) -> O`     | `ContextPayload` |
//!
//! where `In: DeserializeOwned` is decoded from the JSON payload and `O` is
//! either `()` or `Result<T, E>` with `T: Serialize` and `E: Display`. The shape
//! is resolved once, when the handler is wrapped into a [`Function`]; calls never
//! inspect it again.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Errors from running a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not decode into the handler's input type.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The handler's output could not be encoded.
    #[error("failed to encode output: {0}")]
    Encode(#[source] serde_json::Error),

    /// The handler returned an error.
    #[error("{0}")]
    Function(String),
}

impl From<HandlerError> for Status {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Decode(_) => Status::invalid_argument(err.to_string()),
            HandlerError::Encode(_) | HandlerError::Function(_) => Status::internal(err.to_string()),
        }
    }
}

/// What a handler takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    None,
    Payload,
    ContextPayload,
}

/// What a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// `()`: the call always answers `"null"`.
    None,
    /// `Result<T, E>`: `T` is JSON-encoded, `E` becomes an internal error.
    Result,
}

/// Resolved shape of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub input: InputKind,
    pub output: OutputKind,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = match self.input {
            InputKind::None => "()",
            InputKind::Payload => "(In)",
            InputKind::ContextPayload => "(Context, In)",
        };
        let output = match self.output {
            OutputKind::None => "()",
            OutputKind::Result => "Result<T, E>",
        };
        write!(f, "{input} -> {output}")
    }
}

/// Per-call information for handlers that take a `Context`.
#[derive(Debug, Clone, Default)]
pub struct Context {
    remote_addr: Option<SocketAddr>,
    deadline: Option<Instant>,
}

impl Context {
    pub(crate) fn from_parts(remote_addr: Option<SocketAddr>, metadata: &MetadataMap) -> Self {
        let deadline = metadata
            .get("grpc-timeout")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_timeout)
            .and_then(|timeout| Instant::now().checked_add(timeout));

        Self {
            remote_addr,
            deadline,
        }
    }

    /// Address of the caller, when served over TCP.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the caller stops waiting, if it said.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Parse a `grpc-timeout` value (`"<digits><unit>"`, at most 8 digits).
fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => amount.checked_mul(3600).map(Duration::from_secs),
        "M" => amount.checked_mul(60).map(Duration::from_secs),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

mod private {
    pub trait Sealed<M> {}
    pub trait SealedOutput {}
}

/// Handler return types.
pub trait IntoOutput: private::SealedOutput + Send + 'static {
    #[doc(hidden)]
    const KIND: OutputKind;

    #[doc(hidden)]
    fn into_output(self) -> Result<String, HandlerError>;
}

impl private::SealedOutput for () {}

impl IntoOutput for () {
    const KIND: OutputKind = OutputKind::None;

    fn into_output(self) -> Result<String, HandlerError> {
        Ok("null".to_string())
    }
}

impl<T, E> private::SealedOutput for Result<T, E> {}

impl<T, E> IntoOutput for Result<T, E>
where
    T: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    const KIND: OutputKind = OutputKind::Result;

    fn into_output(self) -> Result<String, HandlerError> {
        match self {
            Ok(value) => serde_json::to_string(&value).map_err(HandlerError::Encode),
            Err(e) => Err(HandlerError::Function(e.to_string())),
        }
    }
}

/// A function that can be registered. Implemented for the three shapes above;
/// `M` only tells the shapes apart.
pub trait Handler<M>: private::Sealed<M> + Send + Sync + 'static {
    #[doc(hidden)]
    fn signature(&self) -> Signature;

    #[doc(hidden)]
    fn call(&self, ctx: Context, payload: String) -> BoxFuture<'static, Result<String, HandlerError>>;
}

fn decode<In: DeserializeOwned>(payload: &str) -> Result<In, HandlerError> {
    serde_json::from_str(payload).map_err(HandlerError::Decode)
}

fn finish<Fut>(fut: Fut) -> BoxFuture<'static, Result<String, HandlerError>>
where
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutput,
{
    Box::pin(async move { fut.await.into_output() })
}

impl<F, Fut> private::Sealed<()> for F
where
    F: Fn() -> Fut,
{
}

impl<F, Fut> Handler<()> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutput,
{
    fn signature(&self) -> Signature {
        Signature {
            input: InputKind::None,
            output: <Fut::Output as IntoOutput>::KIND,
        }
    }

    fn call(&self, _ctx: Context, _payload: String) -> BoxFuture<'static, Result<String, HandlerError>> {
        finish(self())
    }
}

impl<F, Fut, In> private::Sealed<(In,)> for F
where
    F: Fn(In) -> Fut,
{
}

impl<F, Fut, In> Handler<(In,)> for F
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutput,
    In: DeserializeOwned + 'static,
{
    fn signature(&self) -> Signature {
        Signature {
            input: InputKind::Payload,
            output: <Fut::Output as IntoOutput>::KIND,
        }
    }

    fn call(&self, _ctx: Context, payload: String) -> BoxFuture<'static, Result<String, HandlerError>> {
        match decode::<In>(&payload) {
            Ok(input) => finish(self(input)),
            Err(e) => Box::pin(future::ready(Err(e))),
        }
    }
}

impl<F, Fut, In> private::Sealed<(Context, In)> for F
where
    F: Fn(Context, In) -> Fut,
{
}

impl<F, Fut, In> Handler<(Context, In)> for F
where
    F: Fn(Context, In) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutput,
    In: DeserializeOwned + 'static,
{
    fn signature(&self) -> Signature {
        Signature {
            input: InputKind::ContextPayload,
            output: <Fut::Output as IntoOutput>::KIND,
        }
    }

    fn call(&self, ctx: Context, payload: String) -> BoxFuture<'static, Result<String, HandlerError>> {
        match decode::<In>(&payload) {
            Ok(input) => finish(self(ctx, input)),
            Err(e) => Box::pin(future::ready(Err(e))),
        }
    }
}

type Call = dyn Fn(Context, String) -> BoxFuture<'static, Result<String, HandlerError>> + Send + Sync;

/// A registered handler with its resolved signature.
#[derive(Clone)]
pub struct Function {
    signature: Signature,
    call: Arc<Call>,
}

impl Function {
    pub fn new<M, H: Handler<M>>(handler: H) -> Self {
        let signature = handler.signature();
        Self {
            signature,
            call: Arc::new(move |ctx: Context, payload: String| handler.call(ctx, payload)),
        }
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Run the handler on a JSON payload and return its JSON output.
    pub async fn invoke(&self, ctx: Context, payload: String) -> Result<String, HandlerError> {
        (self.call)(ctx, payload).await
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Greet {
        name: String,
    }

    #[derive(Debug, Serialize)]
    struct Greeting {
        message: String,
    }

    async fn greet(input: Greet) -> Result<Greeting, String> {
        Ok(Greeting {
            message: format!("hello, {}", input.name),
        })
    }

    async fn ping() -> Result<&'static str, String> {
        Ok("pong")
    }

    async fn record(_input: Greet) -> Result<(), String> {
        Ok(())
    }

    async fn fire_and_forget() {}

    async fn reject(_ctx: Context, input: Greet) -> Result<u32, String> {
        Err(format!("{} is not allowed", input.name))
    }

    #[tokio::test]
    async fn test_payload_handler() {
        let function = Function::new(greet);
        assert_eq!(
            function.signature(),
            Signature {
                input: InputKind::Payload,
                output: OutputKind::Result,
            }
        );

        let output = function
            .invoke(Context::default(), r#"{"name":"ada"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(output, r#"{"message":"hello, ada"}"#);
    }

    #[tokio::test]
    async fn test_no_input_handler_ignores_payload() {
        let function = Function::new(ping);
        assert_eq!(function.signature().input, InputKind::None);

        let output = function
            .invoke(Context::default(), "not json".to_string())
            .await
            .unwrap();
        assert_eq!(output, r#""pong""#);
    }

    #[tokio::test]
    async fn test_error_only_handlers_answer_null() {
        let function = Function::new(record);
        let output = function
            .invoke(Context::default(), r#"{"name":"ada"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(output, "null");

        let function = Function::new(fire_and_forget);
        assert_eq!(function.signature().output, OutputKind::None);
        let output = function
            .invoke(Context::default(), String::new())
            .await
            .unwrap();
        assert_eq!(output, "null");
    }

    #[tokio::test]
    async fn test_context_handler_error() {
        let function = Function::new(reject);
        assert_eq!(function.signature().input, InputKind::ContextPayload);

        let err = function
            .invoke(Context::default(), r#"{"name":"eve"}"#.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Function(ref m) if m == "eve is not allowed"));
        assert_eq!(Status::from(err).code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_argument() {
        let function = Function::new(greet);
        let err = function
            .invoke(Context::default(), r#"{"nom":1}"#.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
        assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_context_deadline_from_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "2S".parse().unwrap());
        let ctx = Context::from_parts(None, &metadata);

        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(2));
        assert!(remaining > Duration::from_secs(1));
        assert!(Context::default().deadline().is_none());
    }

    #[rstest]
    #[case("3S", Some(Duration::from_secs(3)))]
    #[case("10m", Some(Duration::from_millis(10)))]
    #[case("1H", Some(Duration::from_secs(3600)))]
    #[case("5", None)]
    #[case("5d", None)]
    #[case("99999999H", Some(Duration::from_secs(99_999_999 * 3600)))]
    #[case("99999999999999999H", None)]
    #[case("18446744073709551615S", None)]
    fn test_parse_timeout(#[case] value: &str, #[case] expected: Option<Duration>) {
        assert_eq!(parse_timeout(value), expected);
    }

    #[test]
    fn test_oversized_timeout_header_is_ignored() {
        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "18446744073709551615S".parse().unwrap());
        let ctx = Context::from_parts(None, &metadata);
        assert!(ctx.deadline().is_none());

        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "99999999999999999H".parse().unwrap());
        assert!(Context::from_parts(None, &metadata).deadline().is_none());
    }

    #[test]
    fn test_signature_display() {
        let signature = Function::new(reject).signature();
        assert_eq!(signature.to_string(), "(Context, In) -> Result<T, E>");
    }
}
