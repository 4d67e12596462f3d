// src/morse/decoder.rs - timed mark/space code sequences to characters
//
// Decoding has to wait until two characters have been received before either
// can be resolved, because what looks like two characters may be the two
// halves of a single spaced character (American code). The two-character
// window lives in code_buf/space_buf/mark_buf below.
use super::{code_to_char, CodeType, LATCH, UNLATCH};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MIN_DASH_LEN: f32 = 1.5; // dot vs dash threshold (in dots)
const MAX_DASH_LEN: f32 = 9.0; // long dash vs circuit closure threshold (in dots)
const MIN_MORSE_SPACE: f32 = 2.0; // intrasymbol space vs Morse (in dots)
const MAX_MORSE_SPACE: f32 = 6.0; // maximum length of Morse space (in dots)
const MIN_CHAR_SPACE: f32 = 2.7; // intrasymbol space vs character space (in dots)
const MIN_L_LEN: f32 = 5.0; // minimum length of L character (in dots)
const MIN_XL_LEN: f32 = 7.0; // minimum length of 0 character (in dots)
const MORSE_RATIO: f32 = 0.95; // Morse space relative to surrounding spaces
const ALPHA: f32 = 0.5; // weight given to wpm update values (for smoothing)

/// Idle time before the window is flushed, in dot units.
const FLUSH_IDLE_DOTS: u32 = 20;

pub type CharCallback = Box<dyn Fn(&str, f32) + Send>;

struct ReaderState {
    code_type: CodeType,
    wpm: u16,
    dot_len: i32,  // nominal dot length (ms)
    tru_dot: i32,  // actual length of a typical dot (ms)
    code_buf: [String; 2], // code elements for two characters
    space_buf: [i32; 2],   // space before each character
    mark_buf: [i32; 2],    // length of last dot or dash in character
    n_chars: usize,        // number of complete characters in buffer
    latched: bool,         // circuit latched closed by a +1 element
    mark: i32,             // accumulated mark length
    space: i32,            // accumulated space length
    // Detected code speed. Starts at the configured speed.
    d_wpm: u16,
    d_dot_len: i32,
    d_tru_dot: i32,
    d_update_missed: u32,
    decode_at_detected: bool,
    callback: CharCallback,
}

struct Flusher {
    deadline: Mutex<FlushState>,
    cvar: Condvar,
}

#[derive(Clone, Copy, PartialEq)]
enum FlushState {
    Idle,
    At(Instant),
    Shutdown,
}

/// Code reader: push one code sequence at a time through [`Reader::decode`];
/// resolved characters arrive through the callback as
/// `(text, spacing)` where `spacing` is the preceding space measured in
/// character-space widths minus one (can be negative).
///
/// Malformed input never fails: unrecognized element patterns are delivered
/// as bracketed literals like `[..-]`.
pub struct Reader {
    state: Arc<Mutex<ReaderState>>,
    flusher: Arc<Flusher>,
    flusher_thread: Option<JoinHandle<()>>,
}

impl Reader {
    pub fn new(
        wpm: u16,
        cwpm: u16,
        code_type: CodeType,
        decode_at_detected: bool,
        callback: CharCallback,
    ) -> Self {
        let wpm = wpm.max(cwpm).max(1);
        let dot_len = 1200 / wpm as i32;
        let state = Arc::new(Mutex::new(ReaderState {
            code_type,
            wpm,
            dot_len,
            tru_dot: dot_len,
            code_buf: [String::new(), String::new()],
            space_buf: [0, 0],
            mark_buf: [0, 0],
            n_chars: 0,
            latched: false,
            mark: 0,
            space: 1,
            d_wpm: wpm,
            d_dot_len: dot_len,
            d_tru_dot: dot_len,
            d_update_missed: 0,
            decode_at_detected,
            callback,
        }));
        let flusher = Arc::new(Flusher {
            deadline: Mutex::new(FlushState::Idle),
            cvar: Condvar::new(),
        });
        let thread = {
            let state = Arc::clone(&state);
            let flusher = Arc::clone(&flusher);
            thread::Builder::new()
                .name("reader-flusher".into())
                .spawn(move || flusher_body(&state, &flusher))
                .expect("spawn reader flusher")
        };
        Self {
            state,
            flusher,
            flusher_thread: Some(thread),
        }
    }

    pub fn wpm(&self) -> u16 {
        self.state.lock().unwrap().wpm
    }

    pub fn detected_wpm(&self) -> u16 {
        self.state.lock().unwrap().d_wpm
    }

    pub fn set_wpm(&self, wpm: u16, cwpm: u16) {
        self.state.lock().unwrap().set_wpm(wpm.max(cwpm).max(1));
    }

    /// Feed one code sequence through the state machine.
    pub fn decode(&self, code: &[i32]) {
        self.decode_with(code, true);
    }

    /// Feed a sequence, optionally without re-arming the idle flusher
    /// (used when a flush is about to follow immediately).
    pub fn decode_with(&self, code: &[i32], use_flusher: bool) {
        self.cancel_flusher();
        let mut st = self.state.lock().unwrap();
        st.update_detected_wpm(code);
        for &c in code {
            if c < 0 {
                // start/continuation of space, or continuation of a latched mark
                let c = -c;
                if st.latched {
                    st.mark += c;
                } else if st.space > 0 {
                    st.space += c;
                } else {
                    // end of mark
                    let element = if st.mark as f32 > MIN_DASH_LEN * st.tru_dot as f32 {
                        '-'
                    } else {
                        '.'
                    };
                    let n = st.n_chars;
                    st.code_buf[n].push(element);
                    st.mark_buf[n] = st.mark;
                    st.mark = 0;
                    st.space = c;
                }
            } else if c == LATCH {
                st.latched = true;
                if st.space > 0 {
                    if st.space as f32 > MIN_MORSE_SPACE * st.dot_len as f32 {
                        let sp = st.space;
                        st.decode_char(sp);
                    }
                    st.mark = 0;
                    st.space = 0;
                }
            } else if c == UNLATCH {
                st.latched = false;
            } else {
                // mark
                st.latched = false;
                if st.space > 0 {
                    if st.space as f32 > MIN_MORSE_SPACE * st.dot_len as f32 {
                        let sp = st.space;
                        st.decode_char(sp);
                    }
                    st.mark = c;
                    st.space = 0;
                } else if st.mark > 0 {
                    st.mark += c;
                }
            }
        }
        let idle = Duration::from_millis((FLUSH_IDLE_DOTS * st.tru_dot.max(1) as u32) as u64);
        drop(st);
        if use_flusher {
            self.arm_flusher(idle);
        }
    }

    /// Flush whatever is pending in the window.
    pub fn flush(&self) {
        self.cancel_flusher();
        self.state.lock().unwrap().flush();
    }

    /// Cancel the flusher and stop its thread. Further decodes still work but
    /// are no longer idle-flushed.
    pub fn exit(&mut self) {
        {
            let mut dl = self.flusher.deadline.lock().unwrap();
            *dl = FlushState::Shutdown;
            self.flusher.cvar.notify_all();
        }
        if let Some(t) = self.flusher_thread.take() {
            let _ = t.join();
        }
    }

    fn arm_flusher(&self, after: Duration) {
        let mut dl = self.flusher.deadline.lock().unwrap();
        if *dl != FlushState::Shutdown {
            *dl = FlushState::At(Instant::now() + after);
            self.flusher.cvar.notify_all();
        }
    }

    fn cancel_flusher(&self) {
        let mut dl = self.flusher.deadline.lock().unwrap();
        if *dl != FlushState::Shutdown {
            *dl = FlushState::Idle;
            self.flusher.cvar.notify_all();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.exit();
    }
}

fn flusher_body(state: &Mutex<ReaderState>, flusher: &Flusher) {
    let mut dl = flusher.deadline.lock().unwrap();
    loop {
        match *dl {
            FlushState::Shutdown => return,
            FlushState::Idle => {
                dl = flusher.cvar.wait(dl).unwrap();
            }
            FlushState::At(when) => {
                let now = Instant::now();
                if now >= when {
                    *dl = FlushState::Idle;
                    drop(dl);
                    state.lock().unwrap().flush();
                    dl = flusher.deadline.lock().unwrap();
                } else {
                    let (guard, _) = flusher.cvar.wait_timeout(dl, when - now).unwrap();
                    dl = guard;
                }
            }
        }
    }
}

impl ReaderState {
    fn set_wpm(&mut self, wpm: u16) {
        self.wpm = wpm.max(1);
        self.dot_len = 1200 / self.wpm as i32;
        self.tru_dot = self.dot_len;
    }

    /// Track the sender's speed from adjacent (mark, space) pairs. After too
    /// many consecutive misses, fall back to testing whether a single
    /// down-up cycle looks like a clean dot at some other speed.
    fn update_detected_wpm(&mut self, code: &[i32]) {
        let mut i = 1;
        while i + 2 < code.len() {
            let min_dot = self.d_dot_len / 2;
            let max_dot = self.d_dot_len + self.d_dot_len / 2;
            let c1 = code[i];
            let c2 = code[i + 1];
            let c3 = code[i + 2];
            let du_len = c1 - c2; // mark plus following space
            if c1 > min_dot && c1 < max_dot && du_len < 2 * max_dot && c3 < max_dot {
                let dot_len = du_len / 2;
                self.d_tru_dot =
                    (ALPHA * c1 as f32 + (1.0 - ALPHA) * self.d_tru_dot as f32) as i32;
                self.d_dot_len =
                    (ALPHA * dot_len as f32 + (1.0 - ALPHA) * self.d_dot_len as f32) as i32;
                self.d_wpm = (1200 / self.d_dot_len.max(1)) as u16;
                self.d_update_missed = 0;
            } else {
                self.d_update_missed += 1;
                if self.d_update_missed > 8 {
                    // Try a less granular check: does the down-up cycle look
                    // like a dot at twice the mark length?
                    let du_diff = (2 * c1 - du_len).abs();
                    if (du_diff as f32) / 100.0 < 0.05 {
                        self.d_tru_dot = du_len / 2;
                        self.d_dot_len = self.d_tru_dot.max(1);
                        self.d_wpm = (2400 / du_len.max(1)) as u16;
                        self.d_update_missed = 0;
                    }
                }
            }
            i += 2;
        }
        if self.decode_at_detected && self.d_wpm != self.wpm {
            let w = self.d_wpm;
            self.set_wpm(w);
        }
    }

    fn flush(&mut self) {
        if self.mark > 0 || self.latched {
            let spacing = self.space_buf[self.n_chars];
            if self.mark as f32 > MIN_DASH_LEN * self.tru_dot as f32 {
                let n = self.n_chars;
                self.code_buf[n].push('-');
            } else if self.mark > 2 {
                let n = self.n_chars;
                self.code_buf[n].push('.');
            }
            self.mark_buf[self.n_chars] = self.mark;
            self.mark = 0;
            self.space = 1; // prevent a circuit opening decoding as 'E'
            self.decode_char(i32::MAX);
            self.decode_char(i32::MAX); // a second time, to flush both characters
            self.code_buf = [String::new(), String::new()];
            self.space_buf = [0, 0];
            self.mark_buf = [0, 0];
            self.n_chars = 0;
            if self.latched {
                let factor = spacing as f32 / (3.0 * self.tru_dot as f32) - 1.0;
                (self.callback)("_", factor);
            }
        }
    }

    fn decode_char(&mut self, next_space: i32) {
        self.n_chars += 1; // complete characters in the buffer (1 or 2)
        let mut sp1 = self.space_buf[0]; // space before 1st character
        let sp2 = self.space_buf[1]; // space before 2nd character
        let sp3 = next_space; // space before next character
        let mut code = String::new();
        let mut s: Option<String> = None;
        if self.n_chars == 2
            && (sp2 as f32) < MAX_MORSE_SPACE * self.dot_len as f32
            && MORSE_RATIO * sp1 as f32 > sp2 as f32
            && (sp2 as f32) < MORSE_RATIO * sp3 as f32
        {
            // could be two halves of a spaced character; try combining
            code = format!("{} {}", self.code_buf[0], self.code_buf[1]);
            match self.lookup(&code) {
                Some(ch) if ch != '&' => {
                    s = Some(ch.to_string());
                    self.code_buf[0].clear();
                    self.mark_buf[0] = 0;
                    self.code_buf[1].clear();
                    self.space_buf[1] = 0;
                    self.mark_buf[1] = 0;
                    self.n_chars = 0;
                }
                _ => {
                    code.clear();
                    s = None;
                }
            }
        }
        if self.n_chars == 2 && (sp2 as f32) < MIN_CHAR_SPACE * self.dot_len as f32 {
            // a single character after all; merge the two halves
            let second = std::mem::take(&mut self.code_buf[1]);
            self.code_buf[0].push_str(&second);
            self.mark_buf[0] = self.mark_buf[1];
            self.space_buf[1] = 0;
            self.mark_buf[1] = 0;
            self.n_chars = 1;
        }
        if self.n_chars == 2 {
            // decode the first character; the second stays buffered
            code = self.code_buf[0].clone();
            s = self.lookup(&code).map(|c| c.to_string());
            let mark0 = self.mark_buf[0] as f32;
            let dot = self.dot_len as f32;
            if s.as_deref() == Some("T") && mark0 > MAX_DASH_LEN * dot {
                s = Some("_".into());
            } else if s.as_deref() == Some("T")
                && self.code_type == CodeType::American
                && mark0 > MIN_XL_LEN * dot
            {
                s = Some("0".into());
            } else if s.as_deref() == Some("T")
                && self.code_type == CodeType::American
                && mark0 > MIN_L_LEN * dot
            {
                s = Some("L".into());
            } else if s.as_deref() == Some("E") {
                if self.mark_buf[0] == 1 {
                    s = Some("_".into());
                } else if self.mark_buf[0] == 2 {
                    s = Some("_".into());
                    sp1 = 0; // no space between the underscores
                }
            }
            self.code_buf[0] = std::mem::take(&mut self.code_buf[1]);
            self.space_buf[0] = self.space_buf[1];
            self.mark_buf[0] = self.mark_buf[1];
            self.space_buf[1] = 0;
            self.mark_buf[1] = 0;
            self.n_chars = 1;
        }
        self.space_buf[self.n_chars] = next_space;
        let text = match s {
            Some(t) => t,
            None if !code.is_empty() => format!("[{code}]"), // heard but unknown
            None => return,
        };
        let factor = sp1 as f32 / (3.0 * self.tru_dot as f32) - 1.0;
        (self.callback)(&text, factor);
    }

    fn lookup(&self, code: &str) -> Option<char> {
        code_to_char(self.code_type, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn reader(ct: CodeType, wpm: u16) -> (Reader, mpsc::Receiver<(String, f32)>) {
        let (tx, rx) = mpsc::channel();
        let r = Reader::new(
            wpm,
            0,
            ct,
            false,
            Box::new(move |ch, sp| {
                let _ = tx.send((ch.to_string(), sp));
            }),
        );
        (r, rx)
    }

    fn collect(rx: &mpsc::Receiver<(String, f32)>) -> String {
        let mut out = String::new();
        while let Ok((ch, _)) = rx.try_recv() {
            out.push_str(&ch);
        }
        out
    }

    #[test]
    fn decodes_simple_letter() {
        let (r, rx) = reader(CodeType::International, 20);
        // A: dit dah with a leading gap
        r.decode_with(&[-420, 60, -60, 180], false);
        r.flush();
        assert_eq!(collect(&rx), "A");
    }

    #[test]
    fn resolves_american_spaced_character() {
        let (r, rx) = reader(CodeType::American, 20);
        // "..", a 3-dot internal gap, "." with surrounding spaces that
        // satisfy the 0.95 ratio rule: reads as C, not I then E.
        r.decode_with(&[-300, 60, -60, 60, -180, 60], false);
        r.flush();
        assert_eq!(collect(&rx), "C");
    }

    #[test]
    fn wide_internal_gap_stays_two_characters() {
        let (r, rx) = reader(CodeType::American, 20);
        // Same fragments but the gap fails the ratio test (sp2 > 0.95*sp1).
        r.decode_with(&[-300, 60, -60, 60, -320, 60], false);
        r.flush();
        assert_eq!(collect(&rx), "IE");
    }

    #[test]
    fn american_long_dash_reads_as_l() {
        let (r, rx) = reader(CodeType::American, 20);
        r.decode_with(&[-420, 360, -420, 60], false);
        r.flush();
        let out = collect(&rx);
        assert!(out.starts_with('L'), "got {out:?}");
    }

    #[test]
    fn very_long_mark_reads_as_long_dash_token() {
        let (r, rx) = reader(CodeType::International, 20);
        r.decode_with(&[-420, 700, -420, 60], false);
        r.flush();
        let out = collect(&rx);
        assert!(out.starts_with('_'), "got {out:?}");
    }

    #[test]
    fn unknown_code_is_emitted_as_literal() {
        let (r, rx) = reader(CodeType::International, 20);
        // Eight dits is no International character.
        let mut seq = vec![-420];
        for _ in 0..8 {
            seq.push(60);
            seq.push(-60);
        }
        seq.pop();
        r.decode_with(&seq, false);
        r.flush();
        assert_eq!(collect(&rx), "[........]");
    }

    #[test]
    fn latch_flush_reports_long_mark() {
        let (r, rx) = reader(CodeType::International, 20);
        r.decode_with(&[-420, LATCH], false);
        r.decode_with(&[-2000], false); // latched: accumulates as mark
        r.flush();
        let out = collect(&rx);
        assert!(out.contains('_'), "got {out:?}");
    }

    #[test]
    fn detected_wpm_tracks_sender() {
        let (r, _rx) = reader(CodeType::International, 20);
        // A run of clean 40 wpm dits (dot = 30 ms).
        let mut seq = vec![-420];
        for _ in 0..12 {
            seq.push(30);
            seq.push(-30);
        }
        seq.push(30);
        for _ in 0..4 {
            r.decode_with(&seq, false);
        }
        let d = r.detected_wpm();
        assert!((35..=45).contains(&d), "detected {d}");
        r.flush();
    }

    #[test]
    fn decode_at_detected_follows_sender() {
        let (tx, _rx) = mpsc::channel();
        let r = Reader::new(
            20,
            0,
            CodeType::International,
            true,
            Box::new(move |ch, sp| {
                let _ = tx.send((ch.to_string(), sp));
            }),
        );
        let mut seq = vec![-420];
        for _ in 0..12 {
            seq.push(30);
            seq.push(-30);
        }
        seq.push(30);
        for _ in 0..4 {
            r.decode_with(&seq, false);
        }
        assert!(r.wpm() > 20);
    }
}
