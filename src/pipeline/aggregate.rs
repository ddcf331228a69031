//! Ordered aggregation of page results into document content.

use crate::output::{PageOutcome, PageResult};

/// Body of a page whose backend reply was blank.
pub const EMPTY_PAGE_MARKER: &str = "*empty*";

/// Content of a document in which no page produced any content.
pub const NO_CONTENT_SENTINEL: &str = "No content extracted";

/// Section heading for page `n` (1-based).
pub fn page_marker(n: usize) -> String {
    format!("## Page {n}")
}

/// Join page results into one string, in page order.
///
/// Every page gets a section, so the page count can be recovered from the
/// output: failed pages as `*extraction failed: <reason>*`, blank ones as
/// [`EMPTY_PAGE_MARKER`]. When no page carries content the whole result is
/// [`NO_CONTENT_SENTINEL`].
pub fn aggregate(results: &[PageResult]) -> String {
    if !results
        .iter()
        .any(|r| matches!(r.outcome, PageOutcome::Content(_)))
    {
        return NO_CONTENT_SENTINEL.to_string();
    }

    let mut ordered: Vec<&PageResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.ordinal);

    ordered
        .into_iter()
        .map(|r| {
            let body = match &r.outcome {
                PageOutcome::Content(text) => text.clone(),
                PageOutcome::Empty => EMPTY_PAGE_MARKER.to_string(),
                PageOutcome::Failed(e) => format!("*extraction failed: {}*", e.reason()),
            };
            format!("{}\n\n{}", page_marker(r.ordinal), body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;

    fn page(ordinal: usize, outcome: PageOutcome) -> PageResult {
        PageResult::from_outcome("a.pdf", ordinal, outcome)
    }

    #[test]
    fn pages_are_ordered_regardless_of_completion_order() {
        let results = vec![
            page(3, PageOutcome::Content("three".into())),
            page(1, PageOutcome::Content("one".into())),
            page(2, PageOutcome::Content("two".into())),
        ];
        assert_eq!(
            aggregate(&results),
            "## Page 1\n\none\n\n## Page 2\n\ntwo\n\n## Page 3\n\nthree"
        );
    }

    #[test]
    fn failed_and_empty_pages_keep_their_sections() {
        let results = vec![
            page(1, PageOutcome::Content("one".into())),
            page(2, PageOutcome::Empty),
            page(
                3,
                PageOutcome::Failed(PageError::Timeout { page: 3, secs: 30 }),
            ),
        ];
        let out = aggregate(&results);
        assert!(out.contains("## Page 2\n\n*empty*"));
        assert!(out.contains("## Page 3\n\n*extraction failed: timed out after 30s*"));
        assert_eq!(out.matches("## Page ").count(), 3);
    }

    #[test]
    fn no_content_yields_sentinel() {
        let results = vec![
            page(1, PageOutcome::Empty),
            page(
                2,
                PageOutcome::Failed(PageError::Extraction {
                    page: 2,
                    retries: 2,
                    detail: "boom".into(),
                }),
            ),
        ];
        assert_eq!(aggregate(&results), NO_CONTENT_SENTINEL);
        assert_eq!(aggregate(&[]), NO_CONTENT_SENTINEL);
    }
}
