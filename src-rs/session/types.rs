use std::borrow::Cow;

use thiserror::Error;

/// One response obtained through a session.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn new(url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.to_string(),
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("session setup failed: {0}")]
    Setup(String),
}

/// A long-lived interaction context with the external source (one browser
/// instance, one cookie jar). Not shared between threads.
pub trait Session: Send {
    /// Serial number, for logs.
    fn id(&self) -> u64;

    /// Human-like browsing performed right after the session opens.
    fn warm_up(&mut self) -> Result<(), SessionError>;

    fn fetch(&mut self, url: &str) -> Result<FetchedPage, SessionError>;

    /// Reloads the current page after a challenge.
    fn refresh(&mut self) -> Result<(), SessionError>;

    fn close(&mut self);
}

pub trait SessionFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Session>, SessionError>;
}
