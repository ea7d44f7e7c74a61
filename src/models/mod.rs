use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ── Site ──────────────────────────────────────────────────────────────────────

/// A crawled deals site. Watermarks are keyed per (keyword, site) so more
/// sources can be added without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Site {
    Algumon,
}

impl Site {
    /// Stable string key used in the watermarks table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Algumon => "algumon",
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Keyword ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyword {
    pub id: i64,
    /// Normalized (lowercased, whitespace-stripped), unique.
    pub title: String,
    pub created_at: NaiveDateTime,
}

// ── Listing ───────────────────────────────────────────────────────────────────

/// One crawled item, ranked newest-first by the source. Ephemeral: only the
/// most recent listing per (keyword, site) survives a cycle, as the watermark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    /// Site-assigned id, the diff key.
    pub external_id: String,
    pub title: String,
    pub link: Option<String>,
    /// Site-formatted price string, not normalized.
    pub price: Option<String>,
    /// Free-form JSON blob (shop, posted-at, ...).
    pub metadata: Option<String>,
    pub observed_at: NaiveDateTime,
}

// ── Watermark ─────────────────────────────────────────────────────────────────

/// Persisted pointer to the most-recently-seen top listing for a
/// (keyword, site) pair. Diff baseline; at most one row per pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Watermark {
    pub keyword_id: i64,
    pub site: String,
    pub external_id: String,
    pub link: Option<String>,
    pub price: Option<String>,
    pub metadata: Option<String>,
    pub updated_at: NaiveDateTime,
}

// ── Subscriber ────────────────────────────────────────────────────────────────

/// A subscriber with their subscribed keyword ids, in link order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub keyword_ids: Vec<i64>,
}
