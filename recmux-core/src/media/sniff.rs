//! Byte-signature classification of chunk headers.
//!
//! Only the header window handed in by the caller is inspected, so results for
//! large files depend on what the capture path wrote first. The order of the
//! checks below is the priority order: the first family that matches wins.

use std::sync::OnceLock;

use regex::bytes::Regex;

use super::format::ChunkFormat;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const MATROSKA_SEGMENT_ID: [u8; 4] = [0x18, 0x53, 0x80, 0x67];
const MATROSKA_CLUSTER_ID: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];
const SEGMENT_SCAN_BYTES: usize = 200;
const MP4_BRANDS: [&[u8]; 4] = [b"mp41", b"mp42", b"isom", b"avc1"];
const QUICKTIME_ATOMS: [&[u8]; 3] = [b"moov", b"mdat", b"wide"];

/// Outcome of a signature scan over a header window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureMatch {
    pub format: ChunkFormat,
    pub confidence: u8,
    /// `ftyp` was present but no `moov` atom showed up in the window.
    pub moov_missing: bool,
    /// EBML header followed by a Segment element inside the first 200 bytes.
    pub ebml_complete: bool,
}

impl SignatureMatch {
    fn new(format: ChunkFormat, confidence: u8) -> Self {
        Self {
            format,
            confidence,
            moov_missing: false,
            ebml_complete: false,
        }
    }
}

/// Classifies `header` (the first bytes of a file of `total_size` bytes).
///
/// Returns `None` when nothing matched and the file is too small for the
/// "large unknown binary" bucket.
pub fn sniff(header: &[u8], total_size: u64, unknown_binary_min_bytes: u64) -> Option<SignatureMatch> {
    if contains(header, b"ftyp") {
        let moov_missing = !contains(header, b"moov");
        let confidence = if moov_missing { 6 } else { 10 };
        return Some(SignatureMatch {
            moov_missing,
            ..SignatureMatch::new(ChunkFormat::Mp4, confidence)
        });
    }

    if MP4_BRANDS.iter().any(|brand| contains(header, brand)) {
        return Some(SignatureMatch::new(ChunkFormat::Mp4Variant, 9));
    }

    if QUICKTIME_ATOMS.iter().any(|atom| contains(header, atom)) {
        return Some(SignatureMatch::new(ChunkFormat::Mov, 8));
    }

    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"AVI " {
        return Some(SignatureMatch::new(ChunkFormat::Avi, 8));
    }

    if header.starts_with(&EBML_MAGIC) {
        let scan = &header[..header.len().min(SEGMENT_SCAN_BYTES)];
        let ebml_complete = contains(scan, &MATROSKA_SEGMENT_ID);
        let confidence = if ebml_complete { 7 } else { 3 };
        return Some(SignatureMatch {
            ebml_complete,
            ..SignatureMatch::new(ChunkFormat::Webm, confidence)
        });
    }

    if mp4_tokens().is_match(header) {
        return Some(SignatureMatch::new(ChunkFormat::Mp4Partial, 6));
    }

    if matroska_tokens().is_match(header) {
        return Some(SignatureMatch::new(ChunkFormat::WebmPartial, 2));
    }

    if total_size >= unknown_binary_min_bytes {
        return Some(SignatureMatch::new(ChunkFormat::MediaUnknown, 1));
    }

    None
}

/// Cheap structural check on a merged artifact: a container start marker plus a
/// metadata or data marker must both appear in `head`.
pub fn looks_like_playable_container(head: &[u8]) -> bool {
    if contains(head, b"ftyp") {
        return contains(head, b"moov") || contains(head, b"mdat");
    }
    if head.starts_with(&EBML_MAGIC) {
        return contains(head, &MATROSKA_SEGMENT_ID) || contains(head, &MATROSKA_CLUSTER_ID);
    }
    false
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn mp4_tokens() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| Regex::new(r"(?i-u)mp4|h264|avc1").expect("static pattern"))
}

fn matroska_tokens() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| Regex::new(r"(?i-u)matroska|webm").expect("static pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNKNOWN_MIN: u64 = 10 * 1024;

    fn padded(prefix: &[u8], len: usize) -> Vec<u8> {
        let mut bytes = prefix.to_vec();
        bytes.resize(len, 0x11);
        bytes
    }

    #[test]
    fn complete_mp4_scores_ten() {
        let mut header = b"\x00\x00\x00\x18ftypmp42".to_vec();
        header.extend_from_slice(b"\x00\x00\x00\x08moov");
        let found = sniff(&padded(&header, 512), 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Mp4);
        assert_eq!(found.confidence, 10);
        assert!(!found.moov_missing);
    }

    #[test]
    fn mp4_without_moov_is_downgraded() {
        let header = padded(b"\x00\x00\x00\x18ftypisom\x00\x00\x00\x08mdat", 512);
        let found = sniff(&header, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Mp4);
        assert_eq!(found.confidence, 6);
        assert!(found.moov_missing);
    }

    #[test]
    fn brand_without_ftyp_is_variant() {
        let header = padded(b"\x00\x00\x00\x00isomavc1", 256);
        let found = sniff(&header, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Mp4Variant);
        assert_eq!(found.confidence, 9);
    }

    #[test]
    fn quicktime_and_avi_signatures() {
        let mov = padded(b"\x00\x00\x00\x08wide\x00\x00\x00\x10mdat", 256);
        assert_eq!(sniff(&mov, 4096, UNKNOWN_MIN).unwrap().format, ChunkFormat::Mov);

        let avi = padded(b"RIFF\x10\x00\x00\x00AVI LIST", 256);
        let found = sniff(&avi, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Avi);
        assert_eq!(found.confidence, 8);
    }

    #[test]
    fn ebml_confidence_depends_on_segment_marker() {
        let mut complete = EBML_MAGIC.to_vec();
        complete.extend_from_slice(&[0x9F, 0x42, 0x86, 0x81, 0x01]);
        complete.extend_from_slice(&MATROSKA_SEGMENT_ID);
        let found = sniff(&padded(&complete, 512), 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Webm);
        assert_eq!(found.confidence, 7);
        assert!(found.ebml_complete);

        let mut late = padded(&EBML_MAGIC, 300);
        late[250..254].copy_from_slice(&MATROSKA_SEGMENT_ID);
        let found = sniff(&late, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.confidence, 3);
        assert!(!found.ebml_complete);
    }

    #[test]
    fn loose_tokens_and_unknown_bucket() {
        let partial = padded(b"garbage H264 payload", 256);
        let found = sniff(&partial, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::Mp4Partial);
        assert_eq!(found.confidence, 6);

        let webmish = padded(b"leftover Matroska muxer", 256);
        let found = sniff(&webmish, 4096, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::WebmPartial);
        assert_eq!(found.confidence, 2);

        let noise = padded(b"", 256);
        assert!(sniff(&noise, 4096, UNKNOWN_MIN).is_none());
        let found = sniff(&noise, 64 * 1024, UNKNOWN_MIN).unwrap();
        assert_eq!(found.format, ChunkFormat::MediaUnknown);
        assert_eq!(found.confidence, 1);
    }

    #[test]
    fn playable_container_check() {
        assert!(looks_like_playable_container(b"\x00\x00\x00\x18ftypisom....moov"));
        assert!(!looks_like_playable_container(b"\x00\x00\x00\x18ftypisom...."));
        let mut webm = EBML_MAGIC.to_vec();
        webm.extend_from_slice(&MATROSKA_SEGMENT_ID);
        assert!(looks_like_playable_container(&webm));
        assert!(!looks_like_playable_container(&[0u8; 64]));
    }
}
