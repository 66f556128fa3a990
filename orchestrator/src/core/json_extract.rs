//! Recover a JSON result from free-form executor output.
//!
//! Agent backends often wrap their final JSON in prose or code fences, and some
//! shells emit UTF-16 with a BOM. These helpers decode the bytes and return the
//! first complete JSON object or array found in the text.

use serde_json::Value;

/// Decode executor output, honoring UTF-8 and UTF-16 byte order marks.
pub fn decode_text(raw: &[u8]) -> String {
    if let Some(rest) = raw.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = raw.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    let rest = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw);
    String::from_utf8_lossy(rest).into_owned()
}

fn decode_utf16(raw: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Return the first JSON object or array that parses starting at a `{` or `[`.
pub fn extract_first_json(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|(_, ch)| *ch == '{' || *ch == '[')
        .find_map(|(start, _)| {
            let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => Some(value),
                _ => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let text = "Here is the result:\n```json\n{\"y\": 10, \"notes\": [1, 2]}\n```\nDone.";
        assert_eq!(
            extract_first_json(text),
            Some(json!({"y": 10, "notes": [1, 2]}))
        );
    }

    #[test]
    fn skips_brackets_that_do_not_start_valid_json() {
        let text = "[warn] retrying {not json} then {\"ok\": true}";
        assert_eq!(extract_first_json(text), Some(json!({"ok": true})));
    }

    #[test]
    fn returns_none_without_json() {
        assert_eq!(extract_first_json("no structured output here"), None);
    }

    #[test]
    fn decodes_byte_order_marks() {
        let mut utf8 = vec![0xEF, 0xBB, 0xBF];
        utf8.extend_from_slice(b"{\"a\":1}");
        assert_eq!(decode_text(&utf8), "{\"a\":1}");

        let mut utf16 = vec![0xFF, 0xFE];
        for unit in "{\"a\":1}".encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&utf16), "{\"a\":1}");
    }
}
