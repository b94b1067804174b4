//! Block identifiers and the block-list commit body.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encodes a block token as the service expects: base64 of a fixed-width string.
///
/// All block ids of one blob must have the same encoded length, so the
/// hyphenated UUID form (always 36 chars) is used as the raw token.
pub fn encode_block_id(token: &uuid::Uuid) -> String {
    STANDARD.encode(token.hyphenated().to_string())
}

/// Builds the XML body for a `comp=blocklist` commit, listing ids in order.
pub fn block_list_xml<S: AsRef<str>>(ids: &[S]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id.as_ref());
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Extracts the ids from a block-list body, in document order.
pub fn parse_block_list_xml(xml: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Latest>") {
        let after = &rest[start + "<Latest>".len()..];
        let Some(end) = after.find("</Latest>") else {
            break;
        };
        ids.push(after[..end].to_string());
        rest = &after[end + "</Latest>".len()..];
    }
    ids
}

/// Base64 `Content-MD5` value for a byte slice.
pub fn content_md5(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    STANDARD.encode(Md5::digest(data))
}
