//! Resource embedding as Go byte-slice literals.
//!
//! Text and binary payloads share one encoding path: every payload becomes
//! `var <ident> = []byte{...}`. [`decode`] parses a declaration back into the
//! exact bytes it was generated from.

use std::fmt::Write as _;

use thiserror::Error;

const BYTES_PER_LINE: usize = 12;
const IDENT_PREFIX: &str = "res_";

/// One embedded payload ready to splice into a Go source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedded {
    pub ident: String,
    pub declaration: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no []byte literal found")]
    MissingLiteral,
    #[error("unterminated []byte literal")]
    Unterminated,
    #[error("invalid byte token '{0}'")]
    InvalidToken(String),
}

/// Deterministic Go identifier for a resource or prompt name.
///
/// ASCII alphanumerics are kept, everything else becomes `_`.
pub fn ident_for(name: &str) -> String {
    let mut ident = String::with_capacity(IDENT_PREFIX.len() + name.len());
    ident.push_str(IDENT_PREFIX);
    ident.extend(
        name.chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' }),
    );
    ident
}

pub fn embed(name: &str, bytes: &[u8]) -> Embedded {
    let ident = ident_for(name);
    let mut declaration = String::with_capacity(32 + bytes.len() * 6);
    let _ = write!(declaration, "var {ident} = []byte{{");
    if bytes.is_empty() {
        declaration.push('}');
    } else {
        declaration.push('\n');
        for chunk in bytes.chunks(BYTES_PER_LINE) {
            declaration.push('\t');
            let line: Vec<String> = chunk.iter().map(|b| format!("0x{b:02x},")).collect();
            declaration.push_str(&line.join(" "));
            declaration.push('\n');
        }
        declaration.push('}');
    }
    Embedded { ident, declaration }
}

/// Parse the first `[]byte{...}` literal in `source` back into bytes.
pub fn decode(source: &str) -> Result<Vec<u8>, DecodeError> {
    let start = source.find("[]byte{").ok_or(DecodeError::MissingLiteral)? + "[]byte{".len();
    let len = source[start..].find('}').ok_or(DecodeError::Unterminated)?;
    let body = &source[start..start + len];

    body.split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .strip_prefix("0x")
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| DecodeError::InvalidToken(token.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_byte_value() {
        let payload: Vec<u8> = (0..=255u8).rev().chain(0..=255u8).collect();
        let embedded = embed("all bytes", &payload);
        assert_eq!(embedded.ident, "res_all_bytes");
        assert_eq!(decode(&embedded.declaration).expect("decode"), payload);
    }

    #[test]
    fn round_trips_text_and_empty_payloads() {
        let text = "line one\n\"quoted\" `raw` {braces} é\u{0}";
        let embedded = embed("system-prompt", text.as_bytes());
        assert_eq!(
            decode(&embedded.declaration).expect("decode"),
            text.as_bytes()
        );

        let empty = embed("empty", b"");
        assert_eq!(empty.declaration, "var res_empty = []byte{}");
        assert_eq!(decode(&empty.declaration).expect("decode"), Vec::<u8>::new());
    }

    #[test]
    fn wraps_long_payloads() {
        let embedded = embed("blob", &[0xab; 13]);
        let lines: Vec<&str> = embedded.declaration.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "var res_blob = []byte{");
        assert_eq!(lines[2], "\t0xab,");
        assert_eq!(lines[3], "}");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode("var x = 3"), Err(DecodeError::MissingLiteral));
        assert_eq!(decode("[]byte{0x01, 0x02"), Err(DecodeError::Unterminated));
        assert_eq!(
            decode("[]byte{0x01, 12}"),
            Err(DecodeError::InvalidToken("12".to_string()))
        );
    }
}
