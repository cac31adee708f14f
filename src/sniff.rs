//! Content-based MIME detection and the upload allow-list.

/// MIME types accepted for upload. Aliases cover the names different
/// detectors use for the same format.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    // Images
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "image/bmp",
    "image/tiff",
    // Documents
    "application/pdf",
    "text/plain",
    "text/csv",
    "application/rtf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    // Audio
    "audio/mpeg",
    "audio/wav",
    "audio/x-wav",
    "audio/ogg",
    "audio/aac",
    "audio/flac",
    "audio/x-flac",
    // Video
    "video/mp4",
    "video/webm",
    "video/ogg",
    "video/x-msvideo",
    "video/quicktime",
    // Archives
    "application/zip",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/x-tar",
];

pub const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain";
const SVG: &str = "image/svg+xml";

/// Detects the MIME type of a file from its leading bytes.
///
/// SVG documents are recognised first since generic detectors report them as
/// XML. Then magic numbers, then printable UTF-8 as text. Anything else is
/// `application/octet-stream`.
pub fn sniff_mime(prefix: &[u8]) -> &'static str {
    let text = looks_like_text(prefix);
    if text && looks_like_svg(prefix) {
        return SVG;
    }
    if let Some(kind) = infer::get(prefix) {
        return kind.mime_type();
    }
    if text {
        return TEXT_PLAIN;
    }
    OCTET_STREAM
}

pub fn is_allowed(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    ALLOWED_MIME_TYPES
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(essence))
}

fn looks_like_text(prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return false;
    }
    let valid = match std::str::from_utf8(prefix) {
        Ok(_) => prefix,
        // A multi-byte character cut off by the sniff window is still text.
        Err(err) if err.error_len().is_none() => &prefix[..err.valid_up_to()],
        Err(_) => return false,
    };
    valid
        .iter()
        .all(|&byte| {
            !byte.is_ascii_control() || matches!(byte, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b)
        })
}

/// The first element, after any XML declaration, comments and doctype, is `<svg`.
fn looks_like_svg(prefix: &[u8]) -> bool {
    let text = String::from_utf8_lossy(prefix);
    let mut rest = text.trim_start_matches('\u{feff}');
    loop {
        rest = rest.trim_start();
        let terminator = if rest.starts_with("<?") {
            "?>"
        } else if rest.starts_with("<!--") {
            "-->"
        } else if rest.starts_with("<!") {
            ">"
        } else {
            break;
        };
        match rest.find(terminator) {
            Some(end) => rest = &rest[end + terminator.len()..],
            None => return false,
        }
    }
    rest.get(..4)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("<svg"))
}
