//! The `http.request` node.
//!
//! Sends one request per input item through the execution's HTTP helper,
//! which applies the security policy and resource limits. Parameters, all
//! templated per item:
//! - `url` (required)
//! - `method`, default `GET`
//! - `headers`: object of header names to values
//! - `body`: sent as JSON when present
//!
//! The first of the node's `credentialRefs`, if any, contributes auth
//! headers. A non-2xx answer fails the attempt with
//! [`NodeError::HttpStatus`], which the retry policy may retry.
//!
//! Each output item is `{ statusCode, headers, body }`, where `body` is the
//! decoded JSON when the response parses as JSON and the text otherwise.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use tracing::debug;
use weaver_integration::{HttpRequest, HttpResponse, Method, redact_url};
use weaver_workflow::{
    Item, NodeDescriptor, NodeError, NodeExecutionContext, NodeLogic, OutputByPort,
};

/// Name of the optional credential slot.
pub const AUTH_SLOT: &str = "auth";

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpRequestNode;

#[async_trait]
impl NodeLogic for HttpRequestNode {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("http.request").with_credential(AUTH_SLOT, false)
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        let auth_headers = match ctx.node().credential_refs.first() {
            Some(reference) => ctx.credential(reference).await?.auth_headers(),
            None => Vec::new(),
        };

        let mut out = Vec::with_capacity(items.len());
        for index in 0..items.len() {
            let request = build_request(ctx, index, &auth_headers)?;
            // Query strings often carry tokens; keep them out of logs and errors.
            let location = redact_url(&request.url);
            let method = request.method.clone();

            let response = ctx.http().send(request).await?;
            debug!(
                node_id = %ctx.node_id(),
                %method,
                url = %location,
                status = response.status,
                "http request finished"
            );
            if !response.is_success() {
                return Err(NodeError::HttpStatus {
                    status: response.status,
                    message: format!("{method} {location}"),
                });
            }
            out.push(Item::new(response_item(&response)));
        }
        Ok(OutputByPort::main(out))
    }
}

fn build_request(
    ctx: &NodeExecutionContext,
    index: usize,
    auth_headers: &[(String, String)],
) -> Result<HttpRequest, NodeError> {
    let method = match ctx.parameter("method", index)? {
        JsonValue::Null => Method::GET,
        JsonValue::String(name) => Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| NodeError::validation(format!("invalid HTTP method '{name}'")))?,
        other => {
            return Err(NodeError::validation(format!(
                "parameter 'method' must be a string, got {other}"
            )));
        }
    };
    let url = ctx.string_parameter("url", index)?;
    let mut request = HttpRequest::new(method, url);

    match ctx.parameter("headers", index)? {
        JsonValue::Null => {}
        JsonValue::Object(headers) => {
            for (name, value) in headers {
                let value = match value {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                };
                request = request.header(name, value);
            }
        }
        other => {
            return Err(NodeError::validation(format!(
                "parameter 'headers' must be an object, got {other}"
            )));
        }
    }
    for (name, value) in auth_headers {
        request = request.header(name.clone(), value.clone());
    }

    match ctx.parameter("body", index)? {
        JsonValue::Null => {}
        body => request = request.json(&body),
    }
    Ok(request)
}

fn response_item(response: &HttpResponse) -> JsonValue {
    let body = response
        .json::<JsonValue>()
        .unwrap_or_else(|_| JsonValue::String(response.text()));
    let headers: Map<String, JsonValue> = response
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), JsonValue::String(value.clone())))
        .collect();
    json!({
        "statusCode": response.status,
        "headers": headers,
        "body": body,
    })
}
