//! SIP message helpers used by the fork engine
//!
//! Requests, responses and URIs are the `rvoip-sip-core` types handed over by
//! the transaction layer. This module adds what forking decisions need on top
//! of them: destination matching, GRUU lookup, Reason extraction and
//! To-tagging.

use rvoip_sip_core::TypedHeader;
use rvoip_sip_core::types::headers::HeaderName;
use rvoip_sip_core::types::uri::Scheme;

pub use rvoip_sip_core::types::reason::Reason;
pub use rvoip_sip_core::{Method, Request, Response, StatusCode, Uri};

use crate::errors::{ForkError, ForkResult};

/// Parse a SIP or SIPS URI, with or without angle brackets
pub fn parse_uri(input: &str) -> ForkResult<Uri> {
    let trimmed = input.trim().trim_start_matches('<').trim_end_matches('>');
    let uri: Uri = trimmed
        .parse()
        .map_err(|e| ForkError::invalid_message(format!("bad URI '{}': {}", input, e)))?;
    if matches!(uri.scheme, Scheme::Sip | Scheme::Sips) {
        Ok(uri)
    } else {
        Err(ForkError::invalid_message(format!("unsupported scheme '{}'", uri.scheme)))
    }
}

/// Status code from its numeric value. Unknown values map to `Custom`.
pub fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::Custom(code))
}

/// Standard reason phrase for the status codes the engine synthesizes
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        110 => "Push sent",
        _ => status_code(code).reason_phrase(),
    }
}

/// Bare response with `code` and its standard reason phrase
pub fn response(code: u16) -> Response {
    Response::new(status_code(code)).with_reason(reason_phrase(code))
}

/// `SIP ;cause=200 ;text="Call completed elsewhere"`
pub fn call_completed_elsewhere() -> Reason {
    Reason::new("SIP", 200, Some("Call completed elsewhere"))
}

/// `SIP ;cause=600 ;text="Busy Everywhere"`
pub fn busy_everywhere() -> Reason {
    Reason::new("SIP", 600, Some("Busy Everywhere"))
}

pub trait UriExt {
    /// Value of a URI parameter. Flag parameters yield an empty string.
    fn param(&self, name: &str) -> Option<String>;

    /// Same host and port, regardless of transport
    fn same_destination(&self, other: &Uri) -> bool;
}

impl UriExt for Uri {
    fn param(&self, name: &str) -> Option<String> {
        self.parameters
            .iter()
            .find(|p| p.key().eq_ignore_ascii_case(name))
            .map(|p| p.value().unwrap_or_default())
    }

    fn same_destination(&self, other: &Uri) -> bool {
        self.host.to_string().eq_ignore_ascii_case(&other.host.to_string()) && self.port == other.port
    }
}

pub trait RequestExt {
    /// Copy of this request retargeted to another Request-URI (one per branch)
    fn retarget(&self, uri: Uri) -> Request;

    /// Reason header carried by this request, if any
    fn reason(&self) -> Option<Reason>;

    /// Value of the Priority header, `normal` when absent
    fn priority(&self) -> String;
}

impl RequestExt for Request {
    fn retarget(&self, uri: Uri) -> Request {
        let mut request = self.clone();
        request.uri = uri;
        request
    }

    fn reason(&self) -> Option<Reason> {
        self.headers.iter().find_map(|header| match header {
            TypedHeader::Reason(reason) => Some(reason.clone()),
            _ => None,
        })
    }

    fn priority(&self) -> String {
        match self.header(&HeaderName::Priority) {
            Some(TypedHeader::Priority(priority)) => priority.to_string(),
            _ => "normal".to_string(),
        }
    }
}

pub trait ResponseExt {
    /// Numeric status code
    fn code(&self) -> u16;

    fn is_final(&self) -> bool {
        self.code() >= 200
    }

    /// Add a tag to the To header unless it already carries one.
    /// Returns false when there is no To header to tag.
    fn set_to_tag(&mut self, tag: &str) -> bool;
}

impl ResponseExt for Response {
    fn code(&self) -> u16 {
        self.status.as_u16()
    }

    fn set_to_tag(&mut self, tag: &str) -> bool {
        let to = self.headers.iter_mut().find_map(|header| match header {
            TypedHeader::To(to) => Some(to),
            _ => None,
        });
        match to {
            Some(to) => {
                if to.tag().is_none() {
                    to.set_tag(tag);
                }
                true
            }
            None => false,
        }
    }
}
