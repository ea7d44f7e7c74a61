use std::time::Instant;
use tracing::info;

/// Logs elapsed wall-clock time for a scope when dropped.
pub struct Timer {
    label: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("{} finished in {:.2?}", self.label, self.start.elapsed());
    }
}

/// Normalize a keyword for storage and lookup: strip all whitespace,
/// lowercase. "RTX 4070" and "rtx4070" are the same keyword.
pub fn normalize_keyword(title: &str) -> String {
    title
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}
