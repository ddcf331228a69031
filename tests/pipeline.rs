//! Page pipeline tests against a scripted backend.
//!
//! Pages are synthesised in memory, so no pdfium library is required.

mod common;

use common::{reply, Script, ScriptedBackend};
use docext_worker::pipeline::aggregate::NO_CONTENT_SENTINEL;
use docext_worker::{
    ExtractionContext, ExtractionProgressCallback, ExtractionSchema, PageExtractionPipeline,
    PageOutcome, PageUnit, SchemaItem, SchemaKind, WorkerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn pages(document: &str, n: usize) -> Vec<PageUnit> {
    (1..=n)
        .map(|ordinal| PageUnit {
            document: document.to_string(),
            ordinal,
            image: image::DynamicImage::new_rgb8(64, 48),
        })
        .collect()
}

fn schema() -> ExtractionSchema {
    ExtractionSchema {
        items: vec![SchemaItem {
            name: "total".into(),
            kind: SchemaKind::Field,
            description: "Invoice total".into(),
        }],
    }
}

fn worker(concurrency: usize) -> WorkerConfig {
    WorkerConfig::builder()
        .page_concurrency(concurrency)
        .max_retries(1)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}

// ── Ordering and isolation ──────────────────────────────────────────────────

#[tokio::test]
async fn two_page_document_aggregates_exactly() {
    let backend = ScriptedBackend::new()
        .script("invoice.pdf", 1, Script::Reply(reply("Invoice #123", &[], vec![])))
        .script("invoice.pdf", 2, Script::Reply(reply("   ", &[], vec![])));
    let config = worker(2);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    let results = pipeline.process_pages(pages("invoice.pdf", 2), &ctx).await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[1].outcome, PageOutcome::Empty));
    assert_eq!(
        PageExtractionPipeline::aggregate(&results),
        "## Page 1\n\nInvoice #123\n\n## Page 2\n\n*empty*"
    );
}

#[tokio::test]
async fn concurrent_pages_come_back_in_order() {
    // Early pages finish last.
    let backend = ScriptedBackend::new()
        .script("doc", 1, Script::Delay(Duration::from_millis(150)))
        .script("doc", 2, Script::Delay(Duration::from_millis(80)))
        .script("doc", 3, Script::Delay(Duration::from_millis(20)));
    let config = worker(4);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    let results = pipeline.process_pages(pages("doc", 4), &ctx).await;

    let ordinals: Vec<usize> = results.iter().map(|r| r.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3, 4]);

    let content = PageExtractionPipeline::aggregate(&results);
    let p1 = content.find("text of doc p1").unwrap();
    let p4 = content.find("text of doc p4").unwrap();
    assert!(p1 < p4);
    assert!(content.starts_with("## Page 1\n\n"));
}

#[tokio::test]
async fn failed_page_does_not_abort_its_siblings() {
    let backend = ScriptedBackend::new().script("doc", 2, Script::Fail("model overloaded".into()));
    let config = worker(2);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    let results = pipeline.process_pages(pages("doc", 3), &ctx).await;

    assert!(matches!(results[0].outcome, PageOutcome::Content(_)));
    assert!(results[1].outcome.is_failed());
    assert_eq!(results[1].retries, 1);
    assert!(matches!(results[2].outcome, PageOutcome::Content(_)));

    let content = PageExtractionPipeline::aggregate(&results);
    assert!(content.contains("## Page 2\n\n*extraction failed:"), "{content}");
    assert!(content.contains("model overloaded"), "{content}");
    assert!(content.contains("text of doc p3"));

    // Page 2 was tried twice, the others once.
    let calls = backend.calls();
    assert_eq!(calls.iter().filter(|c| c.ordinal == 2).count(), 2);
    assert_eq!(calls.len(), 4);
}

#[tokio::test]
async fn page_images_exist_only_during_the_call() {
    let backend = ScriptedBackend::new();
    let config = worker(2);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "hosted_vllm/some-model",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    pipeline.process_pages(pages("doc", 3), &ctx).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert!(call.file_existed, "{} missing during call", call.path.display());
        assert!(call.path.starts_with(scratch.path()));
        assert!(!call.path.exists());
        assert_eq!(call.model, "hosted_vllm/some-model");
    }
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn blank_and_failed_pages_yield_the_sentinel() {
    let backend = ScriptedBackend::new()
        .script("doc", 1, Script::Reply(reply("   \n", &[], vec![])))
        .script("doc", 2, Script::Fail("bad reply".into()));
    let config = worker(1);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    let results = pipeline.process_pages(pages("doc", 2), &ctx).await;

    assert_eq!(results[0].outcome, PageOutcome::Empty);
    assert_eq!(PageExtractionPipeline::aggregate(&results), NO_CONTENT_SENTINEL);
}

#[tokio::test]
async fn structured_values_travel_with_the_page() {
    let backend = ScriptedBackend::new().script(
        "doc",
        1,
        Script::Reply(reply("Total 42.00", &[("total", "42.00")], vec![])),
    );
    let config = worker(1);
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    let pipeline = PageExtractionPipeline::new(&backend, &config);
    let result = pipeline.extract_page(pages("doc", 1).remove(0), &ctx).await;

    assert_eq!(result.outcome, PageOutcome::Content("Total 42.00".into()));
    assert_eq!(result.fields.len(), 1);
    assert_eq!(result.fields[0].value, "42.00");
    assert_eq!(result.retries, 0);
}

// ── Progress events ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Counting {
    starts: AtomicUsize,
    completes: AtomicUsize,
    errors: AtomicUsize,
}

impl ExtractionProgressCallback for Counting {
    fn on_page_start(&self, _: &str, _: usize, _: usize) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_complete(&self, _: &str, _: usize, _: usize, _: usize) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _: &str, _: usize, _: usize, _: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_events_fire_per_page() {
    let counting = Arc::new(Counting::default());
    let config = WorkerConfig::builder()
        .page_concurrency(3)
        .max_retries(0)
        .progress_callback(counting.clone() as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let backend = ScriptedBackend::new().script("doc", 3, Script::Fail("nope".into()));
    let scratch = tempfile::tempdir().unwrap();
    let schema = schema();
    let ctx = ExtractionContext {
        schema: &schema,
        model: "m",
        max_img_size: 32,
        scratch_dir: scratch.path(),
    };

    PageExtractionPipeline::new(&backend, &config)
        .process_pages(pages("doc", 5), &ctx)
        .await;

    assert_eq!(counting.starts.load(Ordering::SeqCst), 5);
    assert_eq!(counting.completes.load(Ordering::SeqCst), 4);
    assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
}
