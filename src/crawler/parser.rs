//! Search-results parser: raw HTML → ordered listings.
//!
//! The source ranks listings newest-first; document order is preserved
//! end-to-end so the diff engine can anchor on the top item.

use chrono::Utc;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::models::Listing;

/// Parse a search-results page into listings, in feed order. Items without
/// an external id cannot be diffed and are skipped.
pub fn parse_search_page(html: &str, page_url: &str) -> Vec<Listing> {
    let doc = Html::parse_document(html);

    let Ok(item_sel) = Selector::parse("ul.product-list li.product") else {
        return Vec::new();
    };
    let Ok(link_sel) = Selector::parse("a.product-link") else {
        return Vec::new();
    };
    let Ok(title_sel) = Selector::parse(".product-title") else {
        return Vec::new();
    };
    let Ok(price_sel) = Selector::parse(".product-price") else {
        return Vec::new();
    };
    let Ok(shop_sel) = Selector::parse(".shop-name") else {
        return Vec::new();
    };
    let Ok(posted_sel) = Selector::parse(".posted-at") else {
        return Vec::new();
    };

    let base = Url::parse(page_url).ok();
    let now = Utc::now().naive_utc();
    let mut listings = Vec::new();

    for item in doc.select(&item_sel) {
        let Some(external_id) = item.value().attr("data-product-id").map(str::to_string) else {
            warn!("listing without data-product-id skipped");
            continue;
        };

        let anchor = item.select(&link_sel).next();
        let link = anchor
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_link(base.as_ref(), href));

        let title = item
            .select(&title_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        let price = item
            .select(&price_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|p| !p.is_empty());

        let shop = item
            .select(&shop_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());
        let posted = item
            .select(&posted_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());

        let metadata = if shop.is_some() || posted.is_some() {
            Some(serde_json::json!({ "shop": shop, "posted": posted }).to_string())
        } else {
            None
        };

        listings.push(Listing {
            external_id,
            title,
            link,
            price,
            metadata,
            observed_at: now,
        });
    }

    listings
}

/// Resolve a possibly-relative href against the page URL.
fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(abs) => abs.to_string(),
        None => href.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://www.algumon.com/search/ssd";

    fn item(id: &str, title: &str, price: &str) -> String {
        format!(
            r#"<li class="product" data-product-id="{id}">
                 <a class="product-link" href="/deal/{id}">
                   <span class="product-title">{title}</span>
                   <span class="product-price">{price}</span>
                 </a>
                 <span class="shop-name">쿠팡</span>
                 <span class="posted-at">5분 전</span>
               </li>"#
        )
    }

    fn page(items: &[String]) -> String {
        format!(
            "<html><body><ul class=\"product-list\">{}</ul></body></html>",
            items.join("")
        )
    }

    #[test]
    fn parses_items_in_feed_order() {
        let html = page(&[
            item("301", "삼성 990 PRO 2TB", "189,000원"),
            item("300", "WD SN850X 1TB", "119,000원"),
        ]);

        let listings = parse_search_page(&html, PAGE_URL);
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].external_id, "301");
        assert_eq!(listings[0].title, "삼성 990 PRO 2TB");
        assert_eq!(listings[0].price.as_deref(), Some("189,000원"));
        assert_eq!(listings[1].external_id, "300");
    }

    #[test]
    fn resolves_relative_links() {
        let html = page(&[item("42", "model", "1,000원")]);
        let listings = parse_search_page(&html, PAGE_URL);
        assert_eq!(listings[0].link.as_deref(), Some("https://www.algumon.com/deal/42"));
    }

    #[test]
    fn folds_details_into_metadata() {
        let html = page(&[item("7", "x", "9,900원")]);
        let listings = parse_search_page(&html, PAGE_URL);

        let meta: serde_json::Value =
            serde_json::from_str(listings[0].metadata.as_deref().unwrap()).unwrap();
        assert_eq!(meta["shop"], "쿠팡");
        assert_eq!(meta["posted"], "5분 전");
    }

    #[test]
    fn skips_items_without_external_id() {
        let html = "<html><body><ul class=\"product-list\">\
                    <li class=\"product\"><a class=\"product-link\" href=\"/deal/1\">\
                    <span class=\"product-title\">no id</span></a></li>\
                    </ul></body></html>";
        assert!(parse_search_page(html, PAGE_URL).is_empty());
    }

    #[test]
    fn empty_page_yields_no_listings() {
        assert!(parse_search_page("<html><body></body></html>", PAGE_URL).is_empty());
    }
}
