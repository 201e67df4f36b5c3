//! The raw HTTP hop.
//!
//! Everything above this module speaks `http::Request<Vec<u8>>` /
//! `http::Response<Vec<u8>>`; the transport only moves bytes. Non-2xx statuses
//! are returned as responses, not errors, so the auth layer can see its 401s.

use crate::error::AtelierError;
use async_trait::async_trait;
use http::{Request, Response};

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError>;
}

#[cfg(feature = "reqwest-client")]
pub use imp::ReqwestTransport;

#[cfg(feature = "reqwest-client")]
mod imp {
    use super::*;
    use reqwest::Client;
    use std::time::Duration;

    #[derive(Clone, Default)]
    pub struct ReqwestTransport {
        client: Client,
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Result<Self, AtelierError> {
            let client = Client::builder().timeout(timeout).build()?;
            Ok(Self { client })
        }

        pub fn with_client(client: Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError> {
            let method = req
                .method()
                .as_str()
                .parse::<reqwest::Method>()
                .map_err(|e| AtelierError::InvalidRequest(e.to_string()))?;

            let mut rb = self.client.request(method, req.uri().to_string());

            for (name, value) in req.headers().iter() {
                rb = rb.header(name.as_str(), value.as_bytes());
            }

            let resp = rb.body(req.into_body()).send().await?;

            let status = resp.status();
            let headers = resp.headers().clone();
            let bytes = resp.bytes().await?.to_vec();

            let mut builder = Response::builder().status(status.as_u16());
            for (name, value) in headers.iter() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            Ok(builder.body(bytes)?)
        }
    }
}
