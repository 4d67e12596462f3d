// src/kob/keyer.rs - paddle/keyer state
//
// A keyer/paddle acts as a bug with a separate sounder: no closer, so the
// virtual closer must be used. The state is set from the paddle poller or
// from keyboard shortcuts; the Kob keyer thread turns it into code.
use crate::morse::CodeSource;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyerMode {
    Idle,
    Dits,
    Dah,
}

pub(crate) struct KeyerState {
    pub mode: (KeyerMode, CodeSource),
    pub dit_len: i32,
    pub t_mode_change: Instant,
    pub dits_down: bool,
}

pub(crate) struct Keyer {
    pub state: Mutex<KeyerState>,
}

impl Keyer {
    pub fn new(dit_len: i32) -> Self {
        Self {
            state: Mutex::new(KeyerState {
                mode: (KeyerMode::Idle, CodeSource::Key),
                dit_len,
                t_mode_change: Instant::now(),
                dits_down: false,
            }),
        }
    }

    pub fn mode(&self) -> (KeyerMode, CodeSource) {
        self.state.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: KeyerMode, source: CodeSource) {
        let mut st = self.state.lock().unwrap();
        log::debug!("keyer mode {:?} -> {:?}", st.mode.0, mode);
        st.mode = (mode, source);
    }

    pub fn dit_len(&self) -> i32 {
        self.state.lock().unwrap().dit_len
    }

    pub fn set_dit_len(&self, dit_len: i32) {
        self.state.lock().unwrap().dit_len = dit_len.max(1);
    }
}
