//! Text protocol spoken by the stream server
//!
//! Request:  `STREAM:<PORT>!<PROPERTY>;`
//! Response: an endless sequence of `<seconds>,<value>;` samples

use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::StreamError;
use crate::attribute::AttributeValue;

pub const REQUEST_PREFIX: &str = "STREAM:";
pub const REQUEST_TERMINATOR: u8 = b';';
pub const PORT_SEPARATOR: char = '!';
/// Requests longer than this without a terminator are rejected
pub const MAX_REQUEST_LEN: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub port: String,
    pub property: String,
}

impl fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{}", REQUEST_PREFIX, self.port, PORT_SEPARATOR, self.property)
    }
}

impl StreamRequest {
    /// Parses `STREAM:PORT!PROPERTY` with an optional trailing `;`
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        let request = raw.trim();
        let request = request
            .strip_suffix(REQUEST_TERMINATOR as char)
            .unwrap_or(request)
            .trim();

        let params = request
            .strip_prefix(REQUEST_PREFIX)
            .ok_or_else(|| StreamError::UnknownRequest(request.to_string()))?;

        let mut parts = params.split(PORT_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(port), Some(property), None) if !port.is_empty() && !property.is_empty() => {
                Ok(Self {
                    port: port.to_string(),
                    property: property.to_string(),
                })
            }
            _ => Err(StreamError::MalformedRequest(request.to_string())),
        }
    }
}

/// Reads one request: everything up to and including the first `;`, or all
/// bytes until the client shuts down its write side.
pub async fn read_request<R>(reader: &mut R) -> Result<String, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut request = Vec::with_capacity(64);
    let mut chunk = [0u8; 256];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        if let Some(pos) = chunk[..n].iter().position(|b| *b == REQUEST_TERMINATOR) {
            request.extend_from_slice(&chunk[..=pos]);
            break;
        }
        request.extend_from_slice(&chunk[..n]);

        if request.len() > MAX_REQUEST_LEN {
            return Err(StreamError::RequestTooLong(request.len()));
        }
    }

    if request.len() > MAX_REQUEST_LEN {
        return Err(StreamError::RequestTooLong(request.len()));
    }

    String::from_utf8(request)
        .map_err(|e| StreamError::MalformedRequest(format!("Request is not UTF-8: {}", e)))
}

/// Renders one sample as `<seconds>,<value>;`
pub fn format_sample(elapsed_secs: f64, value: &AttributeValue) -> String {
    format!("{},{};", elapsed_secs, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_requests() {
        let request = StreamRequest::parse("STREAM:outA!Position;").unwrap();
        assert_eq!(request.port, "outA");
        assert_eq!(request.property, "Position");
        assert_eq!(request.to_string(), "STREAM:outA!Position");

        let request = StreamRequest::parse("STREAM:pid!ControlVariable\n").unwrap();
        assert_eq!(request.port, "pid");
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(matches!(
            StreamRequest::parse("GARBAGE"),
            Err(StreamError::UnknownRequest(_))
        ));
        assert!(matches!(
            StreamRequest::parse("STREAM:outA;"),
            Err(StreamError::MalformedRequest(_))
        ));
        assert!(matches!(
            StreamRequest::parse("STREAM:outA!Position!Speed;"),
            Err(StreamError::MalformedRequest(_))
        ));
        assert!(StreamRequest::parse("STREAM:!Position;").is_err());
        assert!(StreamRequest::parse("STREAM:outA!;").is_err());
        assert!(StreamRequest::parse("").is_err());
    }

    #[tokio::test]
    async fn reads_until_terminator() {
        let mut input: &[u8] = b"STREAM:outA!Position;trailing";
        assert_eq!(read_request(&mut input).await.unwrap(), "STREAM:outA!Position;");
    }

    #[tokio::test]
    async fn reads_until_eof_without_terminator() {
        let mut input: &[u8] = b"STREAM:in1!Proximity";
        assert_eq!(read_request(&mut input).await.unwrap(), "STREAM:in1!Proximity");
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected() {
        let big = vec![b'x'; MAX_REQUEST_LEN + 10];
        let mut input: &[u8] = &big;
        assert!(matches!(
            read_request(&mut input).await,
            Err(StreamError::RequestTooLong(_))
        ));
    }

    #[test]
    fn samples_render_as_pairs() {
        assert_eq!(format_sample(1.5, &AttributeValue::Int(42)), "1.5,42;");
        assert_eq!(format_sample(0.0, &AttributeValue::Float(-3.25)), "0,-3.25;");
    }
}
