use super::ErrorData;
use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Renders an error as a JSON object with keys in byte order.
pub(super) fn render(data: &ErrorData) -> String {
    let mut kvs: Vec<(&'static str, String)> = Vec::with_capacity(
        data.ints.len() + data.strs.len() + data.times.len() + 1,
    );

    for (key, value) in data.ints.iter() {
        kvs.push((key.name(), value.to_string()));
    }
    for (key, value) in data.strs.iter() {
        kvs.push((key.name(), escape(value)));
    }
    for (key, value) in data.times.iter() {
        kvs.push((key.name(), fmt_time(*value)));
    }
    if !data.children.is_empty() {
        let children: Vec<&str> = data.children.iter().map(|(_, e)| e.rendered()).collect();
        kvs.push(("referenced_errors", format!("[{}]", children.join(","))));
    }

    kvs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut out = String::from("{");
    for (i, (key, value)) in kvs.iter().enumerate() {
        if i != 0 {
            out.push(',');
        }
        out.push_str(&escape(key));
        out.push(':');
        out.push_str(value);
    }
    out.push('}');
    out
}

/// Quotes `s`, escaping control bytes and every byte outside printable ASCII.
pub(super) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for &b in s.as_bytes() {
        if (32..127).contains(&b) {
            out.push(b as char);
            continue;
        }
        out.push('\\');
        match b {
            b'\x08' => out.push('b'),
            b'\x0c' => out.push('f'),
            b'\n' => out.push('n'),
            b'\r' => out.push('r'),
            b'\t' => out.push('t'),
            _ => {
                out.push_str("u00");
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out.push('"');
    out
}

fn fmt_time(t: SystemTime) -> String {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("\"@{}.{:09}\"", since.as_secs(), since.subsec_nanos())
}
