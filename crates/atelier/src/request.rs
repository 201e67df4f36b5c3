use crate::error::AtelierError;
use http::{HeaderMap, HeaderValue, Method, Request, header};
use serde::Serialize;

/// An outgoing call that can be rebuilt and sent again.
///
/// The gateway needs to replay a request after a token refresh, so the request
/// is kept in this owned form and only turned into an `http::Request` right
/// before each send.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Set once the request has been replayed after a refresh.
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, AtelierError> {
        self.body = serde_json::to_vec(body)?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Builds the wire request, adding a bearer token when one is given.
    pub fn to_http(&self, bearer: Option<&str>) -> Result<Request<Vec<u8>>, AtelierError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
            if let Some(token) = bearer {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| AtelierError::InvalidRequest(e.to_string()))?;
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        Ok(builder.body(self.body.clone())?)
    }

    pub(crate) fn replayed(&self) -> Self {
        Self {
            retried: true,
            ..self.clone()
        }
    }
}
