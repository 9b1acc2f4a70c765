//! Streaming HTML helpers built on `lol_html` for the listing site.

use lol_html::{element, text, HtmlRewriter, OutputSink, Settings};
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;

/// Listing rows alternate between these two classes.
const LISTING_ROW_CLASSES: [&str; 2] = ["evn_list", "odd_list"];

/// Collects the `href` of the second anchor in every listing row.
///
/// The first anchor in a row points at the player, the second at the game.
/// Rows with fewer than two linked anchors are ignored.
pub fn listing_links(html: &str) -> Result<Vec<String>, HtmlError> {
    let rows: RefCell<Vec<Vec<Option<String>>>> = RefCell::new(Vec::new());

    let mut handlers = Vec::new();
    for class in LISTING_ROW_CLASSES {
        handlers.push(element!(format!("tr.{class}"), |_el| {
            rows.borrow_mut().push(Vec::new());
            Ok(())
        }));
        handlers.push(element!(format!("tr.{class} a"), |el| {
            if let Some(row) = rows.borrow_mut().last_mut() {
                row.push(el.get_attribute("href"));
            }
            Ok(())
        }));
    }

    rewrite(html, handlers)?;

    Ok(rows
        .into_inner()
        .into_iter()
        .filter_map(|anchors| anchors.into_iter().nth(1).flatten())
        .collect())
}

/// Reads the page count from the first `table.paginator`.
///
/// Returns `Ok(None)` when the document has no paginator (a single page).
/// The count is the text of the paginator's second-to-last anchor; the last
/// one is the "next" arrow.
pub fn page_count(html: &str) -> Result<Option<u32>, HtmlError> {
    let tables = Cell::new(0usize);
    let anchors: RefCell<Vec<String>> = RefCell::new(Vec::new());

    let handlers = vec![
        element!("table.paginator", |_el| {
            tables.set(tables.get() + 1);
            Ok(())
        }),
        element!("table.paginator a", |_el| {
            if tables.get() == 1 {
                anchors.borrow_mut().push(String::new());
            }
            Ok(())
        }),
        text!("table.paginator a", |chunk| {
            if tables.get() == 1 {
                if let Some(label) = anchors.borrow_mut().last_mut() {
                    label.push_str(chunk.as_str());
                }
            }
            Ok(())
        }),
    ];

    rewrite(html, handlers)?;

    if tables.get() == 0 {
        return Ok(None);
    }
    let anchors = anchors.into_inner();
    let label = anchors
        .len()
        .checked_sub(2)
        .and_then(|idx| anchors.get(idx))
        .ok_or_else(|| {
            HtmlError::Paginator(format!(
                "expected at least two paginator links, found {}",
                anchors.len()
            ))
        })?;
    label
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| HtmlError::Paginator(format!("page label '{}' is not a number", label.trim())))
}

/// Last path segment of a listing link; the stable game identifier.
pub fn game_id(href: &str) -> &str {
    href.rsplit('/').next().unwrap_or(href)
}

/// Reads a pixel offset such as `left: -30px` out of an inline `style` attribute.
pub fn style_px(style: &str, property: &str) -> Option<i32> {
    style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(property))
        .and_then(|(_, value)| {
            let value = value.trim();
            value.strip_suffix("px").unwrap_or(value).trim().parse().ok()
        })
}

fn rewrite<'h>(
    html: &str,
    handlers: Vec<(
        std::borrow::Cow<'static, lol_html::Selector>,
        lol_html::ElementContentHandlers<'h>,
    )>,
) -> Result<(), HtmlError> {
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        NoopSink,
    );
    rewriter
        .write(html.as_bytes())
        .map_err(HtmlError::Rewrite)?;
    rewriter.end().map_err(HtmlError::Rewrite)
}

/// Errors surfaced while reading listing markup.
#[derive(Debug)]
pub enum HtmlError {
    /// The HTML rewriter rejected the markup.
    Rewrite(lol_html::errors::RewritingError),
    /// A paginator was present but unreadable.
    Paginator(String),
}

impl fmt::Display for HtmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rewrite(err) => write!(f, "html rewrite error: {err}"),
            Self::Paginator(reason) => write!(f, "unreadable paginator: {reason}"),
        }
    }
}

impl Error for HtmlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rewrite(err) => Some(err),
            Self::Paginator(_) => None,
        }
    }
}

struct NoopSink;

impl OutputSink for NoopSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <table>
          <tr class="evn_list">
            <td><a href="/player/alice">alice</a></td>
            <td><a href="/gamecomment.pl?gm=101">Game 101</a></td>
          </tr>
          <tr class="odd_list">
            <td><a href="/player/bob">bob</a></td>
            <td><a href="/gamecomment.pl?gm=202">Game 202</a></td>
          </tr>
          <tr class="header"><td><a href="/x">x</a><a href="/y">y</a></td></tr>
          <tr class="evn_list"><td><a href="/player/solo">solo</a></td></tr>
        </table>
    "#;

    #[test]
    fn listing_rows_yield_second_anchor() {
        let links = listing_links(LISTING).expect("listing parses");
        assert_eq!(
            links,
            vec!["/gamecomment.pl?gm=101", "/gamecomment.pl?gm=202"]
        );
        assert_eq!(game_id(&links[0]), "gamecomment.pl?gm=101");
    }

    #[test]
    fn paginator_second_to_last_anchor_is_count() {
        let html = r#"
            <table class="paginator"><tr>
              <td><a href="?p=0">1</a></td>
              <td><a href="?p=1">2</a></td>
              <td><a href="?p=6"> 7 </a></td>
              <td><a href="?p=1">&raquo;</a></td>
            </tr></table>
            <table class="paginator"><tr><td><a>99</a><a>next</a></td></tr></table>
        "#;
        assert_eq!(page_count(html).unwrap(), Some(7));
    }

    #[test]
    fn style_offsets_parse_pixels() {
        let style = "position: absolute; left: -30px; top:0px;";
        assert_eq!(style_px(style, "left"), Some(-30));
        assert_eq!(style_px(style, "top"), Some(0));
        assert_eq!(style_px(style, "width"), None);
        assert_eq!(style_px("left: auto", "left"), None);
    }

    #[test]
    fn missing_paginator_means_single_page() {
        assert_eq!(page_count("<p>one page only</p>").unwrap(), None);
    }

    #[test]
    fn unreadable_paginator_is_an_error() {
        let html = r#"<table class="paginator"><tr><td><a>next</a></td></tr></table>"#;
        assert!(matches!(page_count(html), Err(HtmlError::Paginator(_))));
    }
}
