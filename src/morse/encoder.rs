// src/morse/encoder.rs - characters to timed mark/space code sequences
use super::{char_to_code, CodeSeq, CodeType, Spacing, DOTS_PER_WORD, LATCH, UNLATCH};

/// Code sender: converts characters into timed code elements at a configured
/// WPM, with optional Farnsworth spacing.
///
/// A returned sequence always begins with a negative space (the gap carried
/// over from the previous emission); marks and spaces alternate after that.
pub struct Sender {
    code_type: CodeType,
    spacing: Spacing,
    dot_len: i32,
    char_space: i32,
    word_space: i32,
    /// Gap the next emission must honor (ms).
    space_pending: i32,
}

impl Sender {
    /// Nominal dot length at 20 WPM, used as the keyer default.
    pub const DOT_LEN_20WPM: i32 = 60;

    pub fn new(wpm: u16, cwpm: u16, code_type: CodeType, spacing: Spacing) -> Self {
        let mut sender = Self {
            code_type,
            spacing,
            dot_len: 0,
            char_space: 0,
            word_space: 0,
            space_pending: 0,
        };
        sender.set_wpm(wpm, cwpm);
        sender.space_pending = sender.word_space;
        sender
    }

    pub fn dot_len(&self) -> i32 {
        self.dot_len
    }

    pub fn dash_len(&self) -> i32 {
        3 * self.dot_len
    }

    pub fn char_space_len(&self) -> i32 {
        self.char_space
    }

    pub fn word_space_len(&self) -> i32 {
        self.word_space
    }

    /// Recompute timing for `(text wpm, char wpm)`.
    ///
    /// `cwpm == 0` means "same as wpm" (legacy callers). With spacing `None`
    /// the text is sent flat-out at character speed; otherwise the slower of
    /// the two is the Farnsworth text speed and the faster the char speed.
    pub fn set_wpm(&mut self, wpm: u16, cwpm: u16) {
        let cwpm = if cwpm == 0 { wpm } else { cwpm };
        let (wpm, cwpm) = if self.spacing == Spacing::None {
            (cwpm, cwpm)
        } else {
            (wpm.min(cwpm), wpm.max(cwpm))
        };
        let cwpm = cwpm.max(1) as i32;
        let wpm = wpm.max(1) as i32;
        self.dot_len = 1200 / cwpm;
        self.char_space = 3 * self.dot_len;
        self.word_space = 7 * self.dot_len;
        if self.code_type == CodeType::American {
            // American operators stretch the character space; the word space
            // becomes two character spaces.
            self.char_space += (60000 / cwpm - self.dot_len * DOTS_PER_WORD) / 6;
            self.word_space = 2 * self.char_space;
        }
        let delta = 60000 / wpm - 60000 / cwpm; // Farnsworth stretch per word
        match self.spacing {
            Spacing::None => {}
            Spacing::Char => {
                self.char_space += delta / 6;
                self.word_space += delta / 3;
            }
            Spacing::Word => {
                self.word_space += delta;
            }
        }
    }

    /// Encode one character into a code sequence to append to the stream.
    ///
    /// Directive characters: `+` closes the virtual closer and encodes as
    /// `(-space, +1)`; `~` opens it and encodes as `(-space, +2)`. Unknown
    /// printable characters widen the pending space by a word-minus-char
    /// space (apostrophe and hyphen widen by half under American code).
    pub fn encode(&mut self, ch: char) -> CodeSeq {
        let c = ch.to_ascii_uppercase();
        let mut code = CodeSeq::new();
        match char_to_code(self.code_type, c) {
            None => match c {
                '-' | '\'' | '\u{2019}' => {
                    self.space_pending += (self.word_space - self.char_space) / 2;
                }
                '\r' => {}
                '+' => {
                    code.push(-self.space_pending);
                    code.push(LATCH);
                    self.space_pending = self.char_space;
                }
                '~' => {
                    code.push(-self.space_pending);
                    code.push(UNLATCH);
                    self.space_pending = self.char_space;
                }
                _ => {
                    self.space_pending += self.word_space - self.char_space;
                }
            },
            Some(elements) => {
                for e in elements.chars() {
                    match e {
                        ' ' => {
                            // intra-character gap (American spaced letters)
                            self.space_pending = 3 * self.dot_len;
                            continue;
                        }
                        '.' => {
                            code.push(-self.space_pending);
                            code.push(self.dot_len);
                        }
                        '-' => {
                            code.push(-self.space_pending);
                            code.push(3 * self.dot_len);
                        }
                        '=' => {
                            code.push(-self.space_pending);
                            code.push(6 * self.dot_len);
                        }
                        '#' => {
                            code.push(-self.space_pending);
                            code.push(9 * self.dot_len);
                        }
                        _ => continue,
                    }
                    self.space_pending = self.dot_len;
                }
                self.space_pending = self.char_space;
            }
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(ct: CodeType) -> Sender {
        Sender::new(20, 20, ct, Spacing::None)
    }

    #[test]
    fn international_hi_at_20_wpm() {
        let mut s = sender(CodeType::International);
        let h = s.encode('H');
        // Leading gap is the initial word space; four dits follow.
        assert_eq!(h[0], -420);
        assert_eq!(&h[1..], &[60, -60, 60, -60, 60, -60, 60]);
        let i = s.encode('I');
        assert_eq!(i, vec![-180, 60, -60, 60]);
    }

    #[test]
    fn american_character_space_is_widened() {
        let s = sender(CodeType::American);
        // 3 dots plus (60000/20 - 60*45)/6 = 180 + 50.
        assert_eq!(s.char_space_len(), 230);
        assert_eq!(s.word_space_len(), 460);
    }

    #[test]
    fn american_long_dashes() {
        let mut s = sender(CodeType::American);
        let l = s.encode('L');
        assert_eq!(&l[1..], &[360]); // 6 dots
        let zero = s.encode('0');
        assert_eq!(&zero[1..], &[540]); // 9 dots
    }

    #[test]
    fn american_spaced_character() {
        let mut s = sender(CodeType::American);
        let c = s.encode('C');
        // ".. ." is two dits, an embedded 3-dot gap, then a dit.
        assert_eq!(&c[1..], &[60, -60, 60, -180, 60]);
    }

    #[test]
    fn directives_encode_latch_and_unlatch() {
        let mut s = sender(CodeType::International);
        s.encode('E'); // leaves char space pending
        let close = s.encode('+');
        assert_eq!(close, vec![-180, LATCH]);
        let open = s.encode('~');
        assert_eq!(open, vec![-180, UNLATCH]);
    }

    #[test]
    fn unknown_character_widens_pending_space() {
        let mut s = sender(CodeType::International);
        s.encode('E');
        let empty = s.encode('%');
        assert!(empty.is_empty());
        // Next character leads with char_space + (word - char) = word_space.
        let t = s.encode('T');
        assert_eq!(t[0], -s.word_space_len());
    }

    #[test]
    fn line_return_is_ignored() {
        let mut s = sender(CodeType::International);
        s.encode('E');
        assert!(s.encode('\r').is_empty());
        // Pending space unchanged.
        assert_eq!(s.encode('T')[0], -s.char_space_len());
    }

    #[test]
    fn element_sum_matches_theory() {
        for &wpm in &[15u16, 20, 25, 30] {
            let mut s = Sender::new(wpm, wpm, CodeType::International, Spacing::None);
            let dot = 1200 / wpm as i32;
            let code = s.encode('P'); // .--.
            let marks: i32 = code.iter().filter(|&&e| e > 2).sum();
            assert_eq!(marks, dot * (1 + 3 + 3 + 1));
            let gaps: i32 = code[1..].iter().filter(|&&e| e < 0).map(|e| -e).sum();
            assert_eq!(gaps, dot * 3);
        }
    }

    #[test]
    fn farnsworth_stretches_spaces_only() {
        let mut plain = Sender::new(20, 20, CodeType::International, Spacing::Char);
        let mut farns = Sender::new(10, 20, CodeType::International, Spacing::Char);
        assert_eq!(plain.dot_len(), farns.dot_len());
        assert!(farns.char_space_len() > plain.char_space_len());
        assert!(farns.word_space_len() > plain.word_space_len());
        // Word-spacing mode pushes the whole delta into the word space.
        let word_mode = Sender::new(10, 20, CodeType::International, Spacing::Word);
        assert_eq!(word_mode.char_space_len(), 180);
        assert_eq!(word_mode.word_space_len(), 420 + (6000 - 3000));
        // Mark lengths are identical in all modes.
        assert_eq!(plain.encode('T')[1], farns.encode('T')[1]);
    }
}
