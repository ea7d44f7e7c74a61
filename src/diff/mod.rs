//! Rank-based diff between a fresh listing snapshot and the stored watermark.
//!
//! The source feed is strictly ranked newest-first, so "new" is a prefix of
//! the snapshot: everything strictly before the listing whose external id
//! matches the watermark. The function is pure — the caller persists the
//! returned watermark update *before* consuming the new listings, so a crash
//! between diff and notify can only lose a digest, never duplicate one.

use tracing::warn;

use crate::models::{Listing, Watermark};

/// Which branch of the diff fired. Logged per keyword; `ColdStart` and
/// `WatermarkLost` carry policy decisions worth seeing in operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Feed came back empty; nothing to compare.
    EmptyFeed,
    /// First crawl for this pair: only the newest listing is reported, so a
    /// fresh subscription does not flood the digest with backlog.
    ColdStart,
    /// Top of the feed still matches the watermark.
    NoChange,
    /// Watermark found mid-feed; the prefix before it is new.
    NewListings,
    /// Watermark id missing from the snapshot (scrolled off or delisted).
    /// The whole snapshot is treated as new, capped, and the watermark is
    /// rebased onto the current top listing.
    WatermarkLost,
}

/// New watermark attributes, taken from the newest listing in the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkUpdate {
    pub external_id: String,
    pub link: Option<String>,
    pub price: Option<String>,
    pub metadata: Option<String>,
}

impl From<&Listing> for WatermarkUpdate {
    fn from(listing: &Listing) -> Self {
        Self {
            external_id: listing.external_id.clone(),
            link: listing.link.clone(),
            price: listing.price.clone(),
            metadata: listing.metadata.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DiffOutcome {
    pub kind: DiffKind,
    /// Newly-appeared listings, newest-first (feed order).
    pub new: Vec<Listing>,
    /// Watermark write to commit before the results are consumed.
    pub update: Option<WatermarkUpdate>,
}

impl DiffOutcome {
    fn unchanged(kind: DiffKind) -> Self {
        Self { kind, new: Vec::new(), update: None }
    }
}

/// Compare a fresh snapshot against the stored watermark. `cap` bounds the
/// result only on the `WatermarkLost` branch.
pub fn diff_listings(fresh: &[Listing], watermark: Option<&Watermark>, cap: usize) -> DiffOutcome {
    let Some(first) = fresh.first() else {
        return DiffOutcome::unchanged(DiffKind::EmptyFeed);
    };

    let Some(watermark) = watermark else {
        return DiffOutcome {
            kind: DiffKind::ColdStart,
            new: vec![first.clone()],
            update: Some(WatermarkUpdate::from(first)),
        };
    };

    if first.external_id == watermark.external_id {
        return DiffOutcome::unchanged(DiffKind::NoChange);
    }

    match fresh.iter().position(|l| l.external_id == watermark.external_id) {
        Some(pos) => DiffOutcome {
            kind: DiffKind::NewListings,
            new: fresh[..pos].to_vec(),
            update: Some(WatermarkUpdate::from(first)),
        },
        None => {
            warn!(
                "watermark {} not in fresh snapshot ({} items) — rebasing",
                watermark.external_id,
                fresh.len()
            );
            DiffOutcome {
                kind: DiffKind::WatermarkLost,
                new: fresh[..fresh.len().min(cap)].to_vec(),
                update: Some(WatermarkUpdate::from(first)),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn listing(id: &str) -> Listing {
        Listing {
            external_id: id.to_string(),
            title: format!("deal {id}"),
            link: Some(format!("https://example.com/deal/{id}")),
            price: Some("9,900원".to_string()),
            metadata: None,
            observed_at: Utc::now().naive_utc(),
        }
    }

    fn watermark(id: &str) -> Watermark {
        Watermark {
            keyword_id: 1,
            site: "algumon".to_string(),
            external_id: id.to_string(),
            link: None,
            price: None,
            metadata: None,
            updated_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn first_crawl_reports_only_newest() {
        let fresh = vec![listing("101"), listing("102"), listing("103")];

        let outcome = diff_listings(&fresh, None, 10);

        assert_eq!(outcome.kind, DiffKind::ColdStart);
        assert_eq!(outcome.new.len(), 1);
        assert_eq!(outcome.new[0].external_id, "101");
        assert_eq!(outcome.update.unwrap().external_id, "101");
    }

    #[test]
    fn unchanged_top_means_no_new_deals() {
        let fresh = vec![listing("103"), listing("104")];

        let outcome = diff_listings(&fresh, Some(&watermark("103")), 10);

        assert_eq!(outcome.kind, DiffKind::NoChange);
        assert!(outcome.new.is_empty());
        assert!(outcome.update.is_none());
    }

    #[test]
    fn prefix_before_match_is_new_and_watermark_moves_to_top() {
        let fresh = vec![listing("101"), listing("102"), listing("103")];

        let outcome = diff_listings(&fresh, Some(&watermark("103")), 10);

        assert_eq!(outcome.kind, DiffKind::NewListings);
        let ids: Vec<&str> = outcome.new.iter().map(|l| l.external_id.as_str()).collect();
        assert_eq!(ids, ["101", "102"]);
        assert_eq!(outcome.update.unwrap().external_id, "101");
    }

    #[test]
    fn lost_watermark_reports_capped_snapshot_and_rebases() {
        let fresh: Vec<Listing> = (0..6).map(|i| listing(&format!("20{i}"))).collect();

        let outcome = diff_listings(&fresh, Some(&watermark("999")), 4);

        assert_eq!(outcome.kind, DiffKind::WatermarkLost);
        assert_eq!(outcome.new.len(), 4);
        assert_eq!(outcome.new[0].external_id, "200");
        assert_eq!(outcome.update.unwrap().external_id, "200");
    }

    #[test]
    fn empty_feed_leaves_watermark_alone() {
        let outcome = diff_listings(&[], Some(&watermark("103")), 10);
        assert_eq!(outcome.kind, DiffKind::EmptyFeed);
        assert!(outcome.new.is_empty());
        assert!(outcome.update.is_none());

        let cold = diff_listings(&[], None, 10);
        assert_eq!(cold.kind, DiffKind::EmptyFeed);
        assert!(cold.update.is_none());
    }

    #[test]
    fn second_run_after_update_is_a_no_op() {
        let fresh = vec![listing("101"), listing("102"), listing("103")];

        let first = diff_listings(&fresh, Some(&watermark("103")), 10);
        let update = first.update.unwrap();

        // Persisting the update and re-running on the same snapshot
        // must yield nothing.
        let second = diff_listings(&fresh, Some(&watermark(&update.external_id)), 10);
        assert_eq!(second.kind, DiffKind::NoChange);
        assert!(second.new.is_empty());
    }

    #[test]
    fn update_carries_top_listing_attributes() {
        let mut top = listing("55");
        top.price = Some("1,000원".to_string());
        top.metadata = Some("{\"shop\":\"11번가\"}".to_string());
        let fresh = vec![top.clone(), listing("54")];

        let outcome = diff_listings(&fresh, Some(&watermark("54")), 10);
        let update = outcome.update.unwrap();
        assert_eq!(update.external_id, "55");
        assert_eq!(update.link, top.link);
        assert_eq!(update.price, top.price);
        assert_eq!(update.metadata, top.metadata);
    }
}
