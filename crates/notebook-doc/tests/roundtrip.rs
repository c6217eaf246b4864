//! Byte-exact round-trip tests against real-shaped .ipynb fixtures.

use std::path::PathBuf;

use notebook_doc::{CellKind, Document, MimeRepresentation, Output};
use serde_json::Value;

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {}", path.display(), e))
}

const FIXTURES: [&str; 6] = [
    "stream_output.ipynb",
    "text_output.ipynb",
    "markdown_display.ipynb",
    "png_display.ipynb",
    "json_display.ipynb",
    "extra_output_keys.ipynb",
];

#[test]
fn unmodified_fixtures_serialize_to_identical_bytes() {
    for name in FIXTURES {
        let original = fixture(name);
        let doc = Document::from_serialized_form(&original).unwrap();
        let written = doc.to_serialized_form().unwrap();
        assert_eq!(
            String::from_utf8_lossy(&written),
            String::from_utf8_lossy(&original),
            "{} did not round-trip",
            name
        );
    }
}

#[test]
fn serialization_is_stable_across_repeated_cycles() {
    for name in FIXTURES {
        let once = Document::from_serialized_form(&fixture(name))
            .unwrap()
            .to_serialized_form()
            .unwrap();
        let twice = Document::from_serialized_form(&once)
            .unwrap()
            .to_serialized_form()
            .unwrap();
        assert_eq!(once, twice, "{} is not stable", name);
    }
}

#[test]
fn every_output_record_is_reproduced() {
    for name in FIXTURES {
        let raw: Value = serde_json::from_slice(&fixture(name)).unwrap();
        for cell in raw["cells"].as_array().unwrap() {
            let Some(outputs) = cell.get("outputs").and_then(Value::as_array) else {
                continue;
            };
            for record in outputs {
                let output = Output::from_persisted(record).unwrap();
                assert_eq!(
                    output.output_type().as_str(),
                    record["output_type"].as_str().unwrap()
                );
                assert_eq!(&output.to_persisted(), record, "in {}", name);
            }
        }
    }
}

#[test]
fn png_fixture_resolves_to_decoded_image_with_plain_fallback() {
    let doc = Document::from_serialized_form(&fixture("png_display.ipynb")).unwrap();
    let data = doc.cells()[0].outputs[0].data().unwrap();

    match data.primary() {
        Some(MimeRepresentation::Png(bytes)) => assert!(bytes.starts_with(b"\x89PNG")),
        other => panic!("expected png, got {:?}", other),
    }
    assert_eq!(
        data.plain().as_deref(),
        Some("<Figure size 640x480 with 1 Axes>")
    );
}

#[test]
fn json_fixture_keeps_unknown_widget_mime() {
    let doc = Document::from_serialized_form(&fixture("json_display.ipynb")).unwrap();
    let data = doc.cells()[0].outputs[0].data().unwrap();

    assert!(matches!(data.primary(), Some(MimeRepresentation::Json(_))));
    assert!(data.contains("application/vnd.custom.widget+json"));
}

#[test]
fn markdown_fixture_prefers_markdown_then_html() {
    let doc = Document::from_serialized_form(&fixture("markdown_display.ipynb")).unwrap();
    let code = &doc.cells()[1];
    assert_eq!(doc.cells()[0].kind, CellKind::Markdown);

    assert!(matches!(
        code.outputs[0].data().unwrap().primary(),
        Some(MimeRepresentation::Markdown(_))
    ));
    assert!(matches!(
        code.outputs[1].data().unwrap().primary(),
        Some(MimeRepresentation::Html(_))
    ));
}

#[test]
fn extra_output_keys_survive_edits_elsewhere() {
    let mut doc = Document::from_serialized_form(&fixture("extra_output_keys.ipynb")).unwrap();
    let first = doc.cells()[0].id.clone();
    doc.add_cell(CellKind::Markdown, Some(&first));
    let text = String::from_utf8(doc.to_serialized_form().unwrap()).unwrap();

    let raw: Value = serde_json::from_str(&text).unwrap();
    let outputs = &raw["cells"][0]["outputs"];
    assert_eq!(outputs[0]["x-origin"]["tool"], "papermill");
    assert!(outputs[1].get("metadata").is_none());
    assert_eq!(outputs[2]["scrolled"], true);
}

#[test]
fn cells_without_ids_get_stable_memory_ids() {
    let doc = Document::from_serialized_form(&fixture("text_output.ipynb")).unwrap();
    let ids: Vec<_> = doc.cells().iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| uuid::Uuid::parse_str(id).is_ok()));

    // Same process, same document object: ids do not change on re-read.
    let again: Vec<_> = doc.cells().iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, again);
}

#[test]
fn modified_document_is_still_valid_nbformat() {
    let mut doc = Document::from_serialized_form(&fixture("stream_output.ipynb")).unwrap();
    let first = doc.cells()[0].id.clone();
    doc.reset_cell_outputs(&first);
    doc.set_cell_execution_count(&first, 7);
    doc.append_cell_output(&first, Output::stream("stdout", "changed\n"));
    doc.add_cell(CellKind::Markdown, Some(&first));

    let text = String::from_utf8(doc.to_serialized_form().unwrap()).unwrap();
    assert_ne!(text.as_bytes(), fixture("stream_output.ipynb").as_slice());
    assert!(nbformat::parse_notebook(&text).is_ok());

    let reparsed = Document::from_serialized_form(text.as_bytes()).unwrap();
    assert_eq!(reparsed.cells().len(), 3);
    assert_eq!(reparsed.cells()[0].execution_count, Some(7));
}
