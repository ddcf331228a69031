//! Prompts for schema-driven extraction with a vision-language model.
//!
//! Only [`crate::backend::VlmBackend`] uses these. The remote backend ships
//! the schema as a data frame and lets the service build its own prompt.

use crate::backend::ExtractionSchema;

/// System prompt sent with every page.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a meticulous document analyst. You receive one page image from a business document and a list of fields and tables to extract.

Follow these rules precisely:

1. FIELDS
   - Return the value exactly as printed on the page
   - Omit a field (or set it to null) when it does not appear on this page
   - Never guess a value from outside the page

2. TABLES
   - Return one object per table row, keyed by column header
   - Keep rows in the order they appear on the page
   - Omit a table when it does not appear on this page

3. CONTENT
   - Put a faithful transcription of the page text in "content"

4. OUTPUT FORMAT
   - Output ONLY one JSON object with the keys "content", "fields" and "tables"
   - "fields" maps field name to value, "tables" maps table name to a list of rows
   - Do NOT add commentary or code fences"#;

/// User-turn text describing what to extract from this page.
pub fn schema_instruction(schema: &ExtractionSchema) -> String {
    let mut out = String::new();

    let fields: Vec<_> = schema.fields().collect();
    if !fields.is_empty() {
        out.push_str("Fields to extract:\n");
        for f in fields {
            push_item(&mut out, &f.name, &f.description);
        }
    }

    let tables: Vec<_> = schema.tables().collect();
    if !tables.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Tables to extract:\n");
        for t in tables {
            push_item(&mut out, &t.name, &t.description);
        }
    }

    out.push_str("\nReply with the JSON object only.");
    out
}

fn push_item(out: &mut String, name: &str, description: &str) {
    if description.trim().is_empty() {
        out.push_str(&format!("- {name}\n"));
    } else {
        out.push_str(&format!("- {name}: {}\n", description.trim()));
    }
}
