//! Content negotiation: `Accept` and `Prefer` handling plus XML rendering.

use bytes::Bytes;
use serde_json::Value;

/// Representations the engine can produce for locally composed bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Xml,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Xml => "application/xml",
        }
    }

    /// Serialize a JSON document in this representation.
    pub fn render(&self, value: &Value) -> Bytes {
        match self {
            ContentType::Json => Bytes::from(value.to_string()),
            ContentType::Xml => Bytes::from(to_xml(value)),
        }
    }
}

/// Pick a representation from an `Accept` header.
///
/// A missing or empty header means JSON. Media ranges are ranked by their
/// `q` parameter (ties keep header order); `q=0` excludes a range. Returns
/// `None` when nothing acceptable is supported.
pub fn negotiate(accept: Option<&str>) -> Option<ContentType> {
    let accept = match accept.map(str::trim) {
        None | Some("") => return Some(ContentType::Json),
        Some(a) => a,
    };

    let mut best: Option<(f32, ContentType)> = None;
    for range in accept.split(',') {
        let mut parts = range.split(';');
        let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let quality = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if quality <= 0.0 {
            continue;
        }

        let content_type = match media.as_str() {
            "application/json" | "application/*" | "*/*" => ContentType::Json,
            m if m.ends_with("+json") => ContentType::Json,
            "application/xml" | "text/xml" => ContentType::Xml,
            m if m.ends_with("+xml") => ContentType::Xml,
            _ => continue,
        };
        if best.map_or(true, |(q, _)| quality > q) {
            best = Some((quality, content_type));
        }
    }
    best.map(|(_, content_type)| content_type)
}

/// Status code requested with `Prefer: code=NNN`.
pub fn prefer_code(prefer: Option<&str>) -> Option<u16> {
    prefer?
        .split([';', ','])
        .filter_map(|part| part.trim().strip_prefix("code="))
        .find_map(|code| code.trim().parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code))
}

/// Render a JSON document as XML under a `<root>` element.
///
/// Object keys become elements and array members become `<item>` elements.
pub fn to_xml(value: &Value) -> String {
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push('\n');
    write_element(&mut out, "root", value);
    out
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    let name = element_name(name);
    out.push('<');
    out.push_str(&name);
    out.push('>');
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                write_element(out, key, value);
            }
        }
        Value::Array(items) => {
            for item in items {
                write_element(out, "item", item);
            }
        }
        Value::String(s) => escape_into(out, s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

/// Replace characters that are not valid in an XML element name.
fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(None), Some(ContentType::Json));
        assert_eq!(negotiate(Some("*/*")), Some(ContentType::Json));
        assert_eq!(negotiate(Some("application/xml")), Some(ContentType::Xml));
        assert_eq!(
            negotiate(Some("text/html, application/xml;q=0.9, */*;q=0.1")),
            Some(ContentType::Xml)
        );
        assert_eq!(
            negotiate(Some("application/json;q=0.5, text/xml")),
            Some(ContentType::Xml)
        );
        assert_eq!(negotiate(Some("application/vnd.api+json")), Some(ContentType::Json));
        assert_eq!(negotiate(Some("text/html")), None);
        assert_eq!(negotiate(Some("application/json;q=0")), None);
    }

    #[test]
    fn test_prefer_code() {
        assert_eq!(prefer_code(Some("code=404")), Some(404));
        assert_eq!(prefer_code(Some("return=minimal; code=503")), Some(503));
        assert_eq!(prefer_code(Some("respond-async, code=201")), Some(201));
        assert_eq!(prefer_code(Some("code=abc")), None);
        assert_eq!(prefer_code(Some("code=42")), None);
        assert_eq!(prefer_code(None), None);
    }

    #[test]
    fn test_to_xml() {
        let xml = to_xml(&json!({
            "name": "Tom & Jerry",
            "tags": ["a", "b"],
            "2fa": true
        }));
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<name>Tom &amp; Jerry</name>"));
        assert!(xml.contains("<tags><item>a</item><item>b</item></tags>"));
        assert!(xml.contains("<_2fa>true</_2fa>"));
    }

    #[test]
    fn test_xml_list() {
        let xml = to_xml(&json!([{"id": 1}, {"id": 2}]));
        assert!(xml.ends_with("<root><item><id>1</id></item><item><id>2</id></item></root>"));
    }
}
