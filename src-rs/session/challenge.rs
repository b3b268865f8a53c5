use super::types::FetchedPage;

/// Markers the source serves instead of content when it suspects automation.
pub const DEFAULT_CHALLENGE_MARKERS: [&str; 4] = [
    "拼图校验",
    "captcha",
    "verify you are human",
    "unusual traffic",
];

#[derive(Clone, Debug)]
pub struct ChallengeDetector {
    markers: Vec<String>,
}

impl ChallengeDetector {
    pub fn new(markers: Vec<String>) -> Self {
        let markers = markers
            .into_iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        Self { markers }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// The first marker found in the page body, matched case-insensitively.
    pub fn detect(&self, page: &FetchedPage) -> Option<&str> {
        if self.markers.is_empty() || page.is_pdf() {
            return None;
        }
        let text = page.text_lossy().to_lowercase();
        self.markers
            .iter()
            .find(|marker| text.contains(marker.as_str()))
            .map(String::as_str)
    }
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}
