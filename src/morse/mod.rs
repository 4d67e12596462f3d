// src/morse/mod.rs - code tables, Sender, Reader
pub mod decoder;
pub mod encoder;

pub use decoder::Reader;
pub use encoder::Sender;

use std::collections::HashMap;
use std::sync::OnceLock;

/// A code sequence: signed milliseconds. Positive = mark (key down),
/// negative = space (key up). `+1`/`+2` are the latch/unlatch sentinels.
pub type CodeSeq = Vec<i32>;

/// Latch sentinel: the closer has gone closed, circuit stays marked.
pub const LATCH: i32 = 1;
/// Unlatch sentinel: the closer has gone open, circuit is released.
pub const UNLATCH: i32 = 2;
/// Canonical leading space for a closer transition packet, and the
/// discontinuity marker injected on a wire sequence break.
pub const DISCONTINUITY: i32 = -0x7FFF;

/// Code sequence emitted when the circuit is latched closed.
pub const LATCH_CODE: [i32; 2] = [DISCONTINUITY, LATCH];
/// Code sequence emitted when the circuit is unlatched (opened).
pub const UNLATCH_CODE: [i32; 2] = [DISCONTINUITY, UNLATCH];

/// Code sequences never carry more than this many elements per emission.
pub const MAX_CODE_ELEMENTS: usize = 50;

/// Dot units per word including all spaces (MORSE is 43, PARIS is 47).
pub const DOTS_PER_WORD: i32 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeType {
    American,
    International,
}

/// Where Farnsworth padding is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Spacing {
    None,
    Char,
    Word,
}

/// Where a code sequence came from. Numeric values appear in recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CodeSource {
    Local = 1,
    Wire = 2,
    Player = 3,
    Key = 4,
    Keyboard = 5,
    ModeChange = 6,
}

impl CodeSource {
    pub fn as_tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            2 => CodeSource::Wire,
            3 => CodeSource::Player,
            4 => CodeSource::Key,
            5 => CodeSource::Keyboard,
            6 => CodeSource::ModeChange,
            _ => CodeSource::Local,
        }
    }

    /// True for sources originating on this machine.
    pub fn is_local(self) -> bool {
        !matches!(self, CodeSource::Wire)
    }
}

// ── Code tables ──────────────────────────────────────────────────────────────
// Tab-separated resources: header line, then ASCII<TAB>TYPE<TAB>DOT-DASH.
// The dot-dash alphabet is '.', '-', '=' (long dash), '#' (extra-long dash)
// and ' ' (intra-character gap); the latter three are American only.

const AMERICAN_TABLE: &str = include_str!("../../data/codetable-american.txt");
const INTERNATIONAL_TABLE: &str = include_str!("../../data/codetable-international.txt");

struct CodeTable {
    encode: HashMap<char, &'static str>,
    decode: HashMap<&'static str, char>,
}

fn parse_table(raw: &'static str) -> CodeTable {
    let mut encode = HashMap::new();
    let mut decode = HashMap::new();
    for line in raw.lines().skip(1) {
        let mut fields = line.split('\t');
        let (Some(ch), Some(_ty), Some(code)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Some(ch) = ch.chars().next() else { continue };
        encode.insert(ch, code);
        decode.insert(code, ch);
    }
    CodeTable { encode, decode }
}

fn table(code_type: CodeType) -> &'static CodeTable {
    static AMERICAN: OnceLock<CodeTable> = OnceLock::new();
    static INTERNATIONAL: OnceLock<CodeTable> = OnceLock::new();
    match code_type {
        CodeType::American => AMERICAN.get_or_init(|| parse_table(AMERICAN_TABLE)),
        CodeType::International => INTERNATIONAL.get_or_init(|| parse_table(INTERNATIONAL_TABLE)),
    }
}

/// Dot-dash string for a character, or None if the character has no code.
pub fn char_to_code(code_type: CodeType, ch: char) -> Option<&'static str> {
    table(code_type).encode.get(&ch.to_ascii_uppercase()).copied()
}

/// Character for a dot-dash string, or None if it decodes to nothing.
pub fn code_to_char(code_type: CodeType, code: &str) -> Option<char> {
    table(code_type).decode.get(code).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_load_and_cross_reference() {
        for ct in [CodeType::American, CodeType::International] {
            for ch in ('A'..='Z').chain('0'..='9') {
                let code = char_to_code(ct, ch)
                    .unwrap_or_else(|| panic!("{ch} missing from {ct:?} table"));
                assert_eq!(code_to_char(ct, code), Some(ch));
            }
        }
    }

    #[test]
    fn american_has_spaced_and_long_dash_codes() {
        assert_eq!(char_to_code(CodeType::American, 'C'), Some(".. ."));
        assert_eq!(char_to_code(CodeType::American, 'L'), Some("="));
        assert_eq!(char_to_code(CodeType::American, '0'), Some("#"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(
            char_to_code(CodeType::International, 'q'),
            char_to_code(CodeType::International, 'Q')
        );
    }

    #[test]
    fn directives_are_not_in_the_tables() {
        for ct in [CodeType::American, CodeType::International] {
            assert_eq!(char_to_code(ct, '+'), None);
            assert_eq!(char_to_code(ct, '~'), None);
        }
    }
}
