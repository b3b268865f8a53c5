use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use super::types::{FetchedPage, Session, SessionError, SessionFactory};

pub const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Clone, Debug)]
pub struct HttpSessionConfig {
    pub user_agents: Vec<String>,
    pub warmup_urls: Vec<String>,
    pub timeout: Duration,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            warmup_urls: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opens cookie-keeping HTTP sessions, rotating the user agent per session.
pub struct HttpSessionFactory {
    cfg: HttpSessionConfig,
    next_agent: AtomicUsize,
    serial: AtomicU64,
}

impl HttpSessionFactory {
    pub fn new(mut cfg: HttpSessionConfig) -> Self {
        if cfg.user_agents.is_empty() {
            cfg.user_agents = HttpSessionConfig::default().user_agents;
        }
        if cfg.timeout.is_zero() {
            cfg.timeout = Duration::from_secs(30);
        }
        Self {
            cfg,
            next_agent: AtomicUsize::new(0),
            serial: AtomicU64::new(1),
        }
    }

    /// Round-robin over the configured user agents.
    fn agent(&self) -> &str {
        let idx = self.next_agent.fetch_add(1, Ordering::Relaxed);
        &self.cfg.user_agents[idx % self.cfg.user_agents.len()]
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self) -> Result<Box<dyn Session>, SessionError> {
        let agent = self.agent().to_string();
        let client = Client::builder()
            .cookie_store(true)
            .timeout(self.cfg.timeout)
            .user_agent(agent)
            .build()
            .map_err(|err| SessionError::Setup(err.to_string()))?;
        let id = self.serial.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, "http session opened");
        Ok(Box::new(HttpSession {
            id,
            client,
            warmup_urls: self.cfg.warmup_urls.clone(),
            last_url: None,
        }))
    }
}

pub struct HttpSession {
    id: u64,
    client: Client,
    warmup_urls: Vec<String>,
    last_url: Option<String>,
}

impl HttpSession {
    fn get(&self, url: &str) -> Result<FetchedPage, SessionError> {
        let resp = self.client.get(url).send().map_err(map_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp.bytes().map_err(map_reqwest)?;
        Ok(FetchedPage {
            url: url.to_string(),
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> SessionError {
    if err.is_timeout() {
        SessionError::Timeout(err.to_string())
    } else {
        SessionError::Network(err.to_string())
    }
}

impl Session for HttpSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn warm_up(&mut self) -> Result<(), SessionError> {
        for url in &self.warmup_urls {
            // Best effort: a failing landing page does not spoil the session.
            if let Err(err) = self.get(url) {
                warn!(session = self.id, url = %url, error = %err, "warm-up request failed");
            }
        }
        Ok(())
    }

    fn fetch(&mut self, url: &str) -> Result<FetchedPage, SessionError> {
        self.last_url = Some(url.to_string());
        self.get(url)
    }

    fn refresh(&mut self) -> Result<(), SessionError> {
        match self.last_url.clone() {
            Some(url) => self.get(&url).map(|_| ()),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.last_url = None;
        debug!(session = self.id, "http session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_normalizes_config_and_numbers_sessions() {
        let factory = HttpSessionFactory::new(HttpSessionConfig {
            user_agents: Vec::new(),
            warmup_urls: Vec::new(),
            timeout: Duration::ZERO,
        });
        assert_eq!(factory.cfg.user_agents.len(), DEFAULT_USER_AGENTS.len());
        assert_eq!(factory.cfg.timeout, Duration::from_secs(30));

        let first = factory.open().unwrap();
        let second = factory.open().unwrap();
        assert_eq!(second.id(), first.id() + 1);
    }

    #[test]
    fn user_agents_rotate_per_session() {
        let factory = HttpSessionFactory::new(HttpSessionConfig {
            user_agents: vec!["a".into(), "b".into()],
            ..HttpSessionConfig::default()
        });
        let picked: Vec<&str> = (0..5).map(|_| factory.agent()).collect();
        assert_eq!(picked, vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn warm_up_without_urls_and_refresh_without_page_are_noops() {
        let factory = HttpSessionFactory::new(HttpSessionConfig::default());
        let mut session = factory.open().unwrap();
        assert!(session.warm_up().is_ok());
        assert!(session.refresh().is_ok());
        session.close();
    }
}
