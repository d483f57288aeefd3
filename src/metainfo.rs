//! Building torrent metainfo for locally stored blobs.
//!
//! Every blob is announced as a single-file torrent whose info dictionary is
//! `{length, name, piece length, pieces}`, with the blob digest as the name.
//! The infohash — SHA-1 over the bencoded info dictionary — is the
//! swarm-level identifier registered with the index service.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_derive::Serialize;
use sha1::{Digest, Sha1};

use crate::error::metainfo::Result;

/// Piece length used for every blob torrent, 256 KiB.
pub const PIECE_LENGTH: u64 = 262_144;

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

/// The single-file info dictionary.
///
/// Fields are declared in bencode dictionary key order
/// ("length" < "name" < "piece length" < "pieces"); the serialized bytes are
/// exactly what the infohash is taken over.
#[derive(Debug, Serialize)]
struct InfoDict<'a> {
    length: u64,
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde(with = "serde_bytes")]
    pieces: &'a [u8],
}

/// Computes the infohash the file at `path` will be announced under when its
/// torrent is named `name`: lowercase hex SHA-1 of the bencoded info
/// dictionary.
pub fn infohash_from_file(path: &Path, name: &str, piece_length: u64) -> Result<String> {
    let pieces = piece_hashes(path, piece_length)?;
    let length = std::fs::metadata(path)?.len();
    let encoded = serde_bencode::to_bytes(&InfoDict {
        length,
        name,
        piece_length,
        pieces: &pieces,
    })?;
    Ok(hex::encode(Sha1::digest(&encoded)))
}

/// Concatenated SHA-1 hashes, one per `piece_length` sized piece of the file
/// (the last piece may be shorter).
fn piece_hashes(path: &Path, piece_length: u64) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; piece_length as usize];
    let mut pieces = Vec::new();
    loop {
        let n = read_piece(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        pieces.extend_from_slice(&Sha1::digest(&buf[..n]));
        if n < buf.len() {
            break;
        }
    }
    Ok(pieces)
}

/// Fills `buf` from the reader, short only at end of file.
fn read_piece(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Builds the magnet link announcing `infohash` under the display name
/// `name` via `tracker`.
pub fn magnet_link(infohash: &str, name: &str, tracker: &str) -> String {
    format!(
        "magnet:?xt=urn:btih:{}&dn={}&tr={}",
        infohash,
        percent_encode(name.as_bytes(), URL_ENCODE_RESERVED),
        percent_encode(tracker.as_bytes(), URL_ENCODE_RESERVED),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    use super::*;

    /// Bencodes the info dictionary by hand and hashes it, so the serde
    /// layout (key order, renames, byte-string pieces) is pinned down.
    fn expected_infohash(content: &[u8], name: &str, piece_length: u64) -> String {
        let mut pieces = Vec::new();
        for piece in content.chunks(piece_length as usize) {
            pieces.extend_from_slice(&Sha1::digest(piece));
        }
        let mut encoded = Vec::new();
        encoded.extend_from_slice(format!("d6:lengthi{}e", content.len()).as_bytes());
        encoded.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        encoded.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        encoded.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        encoded.extend_from_slice(&pieces);
        encoded.push(b'e');
        hex::encode(Sha1::digest(&encoded))
    }

    fn temp_blob(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(content).expect("write temp file");
        file
    }

    #[test]
    fn infohash_matches_hand_encoded_dictionary() {
        let content = b"hello world, this is a blob";
        let file = temp_blob(content);

        let infohash = infohash_from_file(file.path(), "sha256:abc123", 8).expect("infohash");
        assert_eq!(infohash, expected_infohash(content, "sha256:abc123", 8));
        assert_eq!(infohash.len(), 40);
        assert!(infohash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn single_short_piece_hashes_the_whole_file() {
        let content = b"tiny";
        let file = temp_blob(content);

        let infohash =
            infohash_from_file(file.path(), "sha256:tiny", PIECE_LENGTH).expect("infohash");
        assert_eq!(infohash, expected_infohash(content, "sha256:tiny", PIECE_LENGTH));
    }

    #[test]
    fn exact_piece_multiple_has_no_trailing_piece() {
        let content = [7u8; 16];
        let file = temp_blob(&content);

        let infohash = infohash_from_file(file.path(), "sha256:even", 8).expect("infohash");
        assert_eq!(infohash, expected_infohash(&content, "sha256:even", 8));
    }

    #[test]
    fn magnet_link_encodes_name_and_tracker() {
        let magnet = magnet_link(
            "0123456789abcdef0123456789abcdef01234567",
            "sha256:deadbeef",
            "http://tracker.example:80/announce",
        );
        assert_eq!(
            magnet,
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
             &dn=sha256%3Adeadbeef\
             &tr=http%3A%2F%2Ftracker.example%3A80%2Fannounce"
        );
    }
}
