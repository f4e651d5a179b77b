//! Content type detection from the leading bytes of a body.
//!
//! Follows the MIME sniffing rules browsers and HTTP servers use: at most the
//! first 512 bytes are considered, markup signatures skip leading whitespace,
//! and anything without a known signature is classified as UTF-8 text when it
//! contains no binary control bytes.

/// Maximum number of bytes inspected.
pub const SNIFF_LEN: usize = 512;

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

const HTML_SIGNATURES: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

struct Masked {
    mask: &'static [u8],
    pattern: &'static [u8],
    content_type: &'static str,
}

const fn exact(pattern: &'static [u8], content_type: &'static str) -> Masked {
    Masked {
        mask: &[0xFF; 16],
        pattern,
        content_type,
    }
}

const MASKED_SIGNATURES: &[Masked] = &[
    exact(b"%PDF-", "application/pdf"),
    exact(b"%!PS-Adobe-", "application/postscript"),
    Masked {
        mask: b"\xFF\xFF\x00\x00",
        pattern: b"\xFE\xFF\x00\x00",
        content_type: "text/plain; charset=utf-16be",
    },
    Masked {
        mask: b"\xFF\xFF\x00\x00",
        pattern: b"\xFF\xFE\x00\x00",
        content_type: "text/plain; charset=utf-16le",
    },
    Masked {
        mask: b"\xFF\xFF\xFF\x00",
        pattern: b"\xEF\xBB\xBF\x00",
        content_type: TEXT_PLAIN_UTF8,
    },
    exact(b"\x00\x00\x01\x00", "image/x-icon"),
    exact(b"\x00\x00\x02\x00", "image/x-icon"),
    exact(b"BM", "image/bmp"),
    exact(b"GIF87a", "image/gif"),
    exact(b"GIF89a", "image/gif"),
    Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WEBPVP",
        content_type: "image/webp",
    },
    exact(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    exact(b"\xFF\xD8\xFF", "image/jpeg"),
    Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"FORM\x00\x00\x00\x00AIFF",
        content_type: "audio/aiff",
    },
    exact(b"ID3", "audio/mpeg"),
    exact(b"OggS\x00", "application/ogg"),
    exact(b"MThd\x00\x00\x00\x06", "audio/midi"),
    Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00AVI ",
        content_type: "video/avi",
    },
    Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WAVE",
        content_type: "audio/wave",
    },
    exact(b"\x1A\x45\xDF\xA3", "video/webm"),
    exact(b"\x00\x01\x00\x00", "font/ttf"),
    exact(b"OTTO", "font/otf"),
    exact(b"ttcf", "font/collection"),
    exact(b"wOFF", "font/woff"),
    exact(b"wOF2", "font/woff2"),
    exact(b"\x1F\x8B\x08", "application/x-gzip"),
    exact(b"PK\x03\x04", "application/zip"),
    exact(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    exact(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    exact(b"\x00\x61\x73\x6D", "application/wasm"),
];

impl Masked {
    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.pattern.len()
            && self
                .pattern
                .iter()
                .zip(self.mask)
                .zip(data)
                .all(|((pattern, mask), byte)| byte & mask == *pattern)
    }
}

/// Infers a content type from the start of a body.
///
/// Always returns a valid content type, falling back to
/// `application/octet-stream`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    let first_non_ws = data
        .iter()
        .position(|b| !is_whitespace(*b))
        .unwrap_or(data.len());
    let markup = &data[first_non_ws..];

    if HTML_SIGNATURES.iter().any(|sig| matches_html(markup, sig)) {
        return "text/html; charset=utf-8";
    }
    if markup.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if let Some(sig) = MASKED_SIGNATURES.iter().find(|sig| sig.matches(data)) {
        return sig.content_type;
    }
    if is_mp4(data) {
        return "video/mp4";
    }
    if markup.iter().any(|b| is_binary(*b)) {
        return OCTET_STREAM;
    }
    TEXT_PLAIN_UTF8
}

/// Case-insensitive tag match followed by a tag-terminating byte.
fn matches_html(data: &[u8], sig: &[u8]) -> bool {
    if data.len() < sig.len() + 1 {
        return false;
    }
    let prefix_matches = sig.iter().zip(data).all(|(expected, actual)| {
        if expected.is_ascii_uppercase() {
            actual & 0xDF == *expected
        } else {
            actual == expected
        }
    });
    prefix_matches && matches!(data[sig.len()], b' ' | b'>')
}

fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < box_size || box_size % 4 != 0 || &data[4..8] != b"ftyp" {
        return false;
    }
    (8..box_size)
        .step_by(4)
        .filter(|start| *start != 12)
        .any(|start| &data[start..start + 3] == b"mp4")
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' ')
}

fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
