//! Machine-readable diagnostic rendering, one JSON object per diagnostic.

use crate::ast::SourceMap;

use super::{Diagnostic, Severity};

pub fn render(d: &Diagnostic, map: Option<&SourceMap>) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            let mut obj = serde_json::json!({
                "start": l.span.start,
                "end": l.span.end,
                "message": l.message,
            });
            if let Some(map) = map {
                let pos = map.position(l.span.start);
                obj["file"] = serde_json::Value::from(map.file());
                obj["line"] = serde_json::Value::from(pos.line);
                obj["col"] = serde_json::Value::from(pos.column);
            }
            obj
        })
        .collect();

    let obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    serde_json::to_string(&obj).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let d = Diagnostic::error("type mismatch");
        let v = parse_json(&render(&d, None));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "type mismatch");
        assert!(v["labels"].as_array().unwrap().is_empty());
    }

    #[test]
    fn render_with_span_and_map() {
        let map = SourceMap::new("t.q", "int x;\nint y;\n");
        let d = Diagnostic::error("bad token").with_span(Span { start: 9, end: 10 }, "here");
        let v = parse_json(&render(&d, Some(&map)));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 9);
        assert_eq!(label["file"], "t.q");
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 3);
    }

    #[test]
    fn render_without_map_omits_positions() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d, None));
        assert!(v["labels"][0].get("line").is_none());
    }

    #[test]
    fn render_notes_in_order() {
        let d = Diagnostic::error("bad").with_note("first").with_note("second");
        let v = parse_json(&render(&d, None));
        let notes = v["notes"].as_array().unwrap();
        assert_eq!(notes[0], "first");
        assert_eq!(notes[1], "second");
    }
}
