//! Handlers compiled into the wrapper binary.

use crate::bridge::protocol::{Event, Response};
use crate::handler::{Context, Handler, StaticLoader};

/// Returns the request body unchanged, with its content type.
pub struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    async fn handle(&self, ctx: &Context, event: Event) -> anyhow::Result<Response> {
        ctx.logger()
            .debug_with("Echoing event", &["size".into(), (event.body.len() as i64).into()])
            .await;
        let mut response = Response::new().with_body(event.body);
        if !event.content_type.is_empty() {
            response = response.with_content_type(event.content_type);
        }
        Ok(response)
    }
}

/// Returns the request body reversed. Text bodies are reversed by character.
pub struct Reverser;

#[async_trait::async_trait]
impl Handler for Reverser {
    async fn handle(&self, _ctx: &Context, event: Event) -> anyhow::Result<Response> {
        let body = match String::from_utf8(event.body) {
            Ok(text) => text.chars().rev().collect::<String>().into_bytes(),
            Err(e) => {
                let mut bytes = e.into_bytes();
                bytes.reverse();
                bytes
            }
        };
        Ok(Response::new().with_body(body))
    }
}

/// Loader holding every built-in handler.
pub fn loader() -> StaticLoader {
    StaticLoader::new()
        .register("echo", || Ok(Box::new(Echo)))
        .register("reverser", || Ok(Box::new(Reverser)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::codec::WireFormat;
    use crate::bridge::transport::{StreamTransport, Transport};
    use crate::handler::Loader;
    use crate::logger::Logger;
    use tokio::sync::Mutex;

    fn context() -> (Context, tokio::io::DuplexStream) {
        let (worker, host) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(worker);
        let transport: Box<dyn Transport> = Box::new(StreamTransport::new(r, w));
        let logger = Logger::new(Arc::new(Mutex::new(transport)), WireFormat::Json.codec());
        (Context::new(logger), host)
    }

    fn event(body: &[u8], content_type: &str) -> Event {
        Event {
            body: body.to_vec(),
            content_type: content_type.into(),
            ..Event::default()
        }
    }

    #[tokio::test]
    async fn echo_keeps_body_and_content_type() {
        let (ctx, _host) = context();
        let resp = Echo
            .handle(&ctx, event(b"{\"a\":1}", "application/json"))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_type, "application/json");
        assert_eq!(resp.body, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn reverser_reverses_characters() {
        let (ctx, _host) = context();
        let resp = Reverser.handle(&ctx, event("héllo".as_bytes(), "")).await.unwrap();
        assert_eq!(resp.body, "olléh".as_bytes());

        let resp = Reverser.handle(&ctx, event(&[0xff, 0x00, 0x01], "")).await.unwrap();
        assert_eq!(resp.body, [0x01u8, 0x00, 0xff]);
    }

    #[test]
    fn loader_knows_builtins() {
        let loader = loader();
        assert_eq!(loader.names().collect::<Vec<_>>(), ["echo", "reverser"]);
        assert!(loader.load(".", "reverser").is_ok());
        assert!(loader.load(".", "Reverser").is_err());
    }
}
