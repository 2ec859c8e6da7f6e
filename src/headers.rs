use std::convert::Infallible;
use std::fmt;

/// Read-only view over the transport request headers. The core only ever
/// reads the `content-type` header to negotiate the protocol version, the
/// rest of the request surface stays with the embedding SDK.
pub trait HeaderMap {
    type Error: fmt::Debug;

    fn extract(&self, name: &str) -> Result<Option<&str>, Self::Error>;
}

impl HeaderMap for Vec<(String, String)> {
    type Error = Infallible;

    fn extract(&self, name: &str) -> Result<Option<&str>, Self::Error> {
        for (k, v) in self.iter() {
            if k.eq_ignore_ascii_case(name) {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}

impl HeaderMap for &[(String, String)] {
    type Error = Infallible;

    fn extract(&self, name: &str) -> Result<Option<&str>, Self::Error> {
        for (k, v) in self.iter() {
            if k.eq_ignore_ascii_case(name) {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}

#[cfg(feature = "http")]
impl HeaderMap for http::HeaderMap {
    type Error = http::header::ToStrError;

    fn extract(&self, name: &str) -> Result<Option<&str>, Self::Error> {
        self.get(name).map(|hv| hv.to_str()).transpose()
    }
}
