pub mod challenge;
pub mod http;
pub mod types;

pub use challenge::{ChallengeDetector, DEFAULT_CHALLENGE_MARKERS};
pub use http::{HttpSession, HttpSessionConfig, HttpSessionFactory, DEFAULT_USER_AGENTS};
pub use types::{FetchedPage, Session, SessionError, SessionFactory};
