//! Selector-driven fragment extraction for company news pages.

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::WebsiteFragment;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid css selector {selector:?}: {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: String,
}

/// `item` picks one element per announcement; the rest are scoped to that element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentSelectors {
    pub item: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub link: Option<String>,
    pub date: Option<String>,
}

const DEFAULT_TITLE: &str = "h1, h2, h3, h4";
const DEFAULT_DATE: &str = "time";

fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional(selector: Option<&str>) -> Result<Option<Selector>, SelectorError> {
    selector.map(parse_selector).transpose()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = crate::clean_text(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(element_text(n)))
}

fn first_href(element: ElementRef<'_>, selector: Option<&Selector>, anchor: &Selector) -> Option<String> {
    if let Some(sel) = selector {
        return element
            .select(sel)
            .next()
            .and_then(|n| n.value().attr("href"))
            .map(ToString::to_string);
    }
    if element.value().name() == "a" {
        if let Some(href) = element.value().attr("href") {
            return Some(href.to_string());
        }
    }
    element
        .select(anchor)
        .next()
        .and_then(|n| n.value().attr("href"))
        .map(ToString::to_string)
}

fn first_date(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let node = element.select(selector).next()?;
    node.value()
        .attr("datetime")
        .map(ToString::to_string)
        .or_else(|| text_or_none(element_text(node)))
}

/// One fragment per `item` match, positioned in document order. Empty matches are kept
/// so the normalizer can report them.
pub fn extract_fragments(
    html: &str,
    selectors: &FragmentSelectors,
) -> Result<Vec<WebsiteFragment>, SelectorError> {
    let item = parse_selector(&selectors.item)?;
    let title = parse_optional(selectors.title.as_deref().or(Some(DEFAULT_TITLE)))?;
    let body = parse_optional(selectors.body.as_deref())?;
    let link = parse_optional(selectors.link.as_deref())?;
    let date = parse_optional(selectors.date.as_deref().or(Some(DEFAULT_DATE)))?;
    let anchor = parse_selector("a[href]")?;

    let document = Html::parse_document(html);
    Ok(document
        .select(&item)
        .enumerate()
        .map(|(position, element)| WebsiteFragment {
            position,
            text: crate::clean_text(&element_text(element)),
            title: title.as_ref().and_then(|sel| select_first_text(element, sel)),
            body: body.as_ref().and_then(|sel| select_first_text(element, sel)),
            href: first_href(element, link.as_ref(), &anchor),
            published: date.as_ref().and_then(|sel| first_date(element, sel)),
        })
        .collect())
}
