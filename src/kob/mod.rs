// src/kob/mod.rs - key, sounder, keyer/paddle and the synth sounder driver
//
// The interface type controls how the physical sounder is driven. The mode
// tables below select the sounder/synth behavior from the closer states, the
// wire connection, and the local-copy policy.
pub mod hardware;
pub mod keyer;

pub use keyer::KeyerMode;

use crate::audio::{create_audio, AudioOutput, AudioType};
use crate::morse::{CodeSource, LATCH, MAX_CODE_ELEMENTS, UNLATCH};
use crate::sync::Event;
use hardware::Hw;
use keyer::Keyer;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Time to ignore transitions due to contact bounce.
const DEBOUNCE: Duration = Duration::from_millis(18);
/// Open gap that ends a code sequence.
const CODE_SPACE: Duration = Duration::from_millis(120);
/// Closed time that signals circuit closure (latch).
const CKT_CLOSE: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceType {
    /// Sounder in series with the key: it clicks without the host driving it.
    Loop,
    /// Host drives the sounder explicitly.
    KeySounder,
    /// Paddle inputs drive the automated keyer instead of producing code.
    Keyer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SounderMode {
    /// Not energized and do not energize.
    Dis,
    /// Energized and left alone (sounder follows the key in the loop).
    Efk,
    /// Energized when key closed, off when key open.
    Fk,
    /// On/off to sound local code; eligible for power-save.
    Slc,
    /// On/off to sound recordings, and nothing else.
    Rec,
    /// On/off to sound remote code; eligible for power-save.
    Src,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthMode {
    Dis,
    Fk,
    Slc,
    Rec,
    Src,
}

// Mode tables. Columns are (key closer, virtual closer) as
// (closed,closed) (closed,open) (open,closed) (open,open); rows are
// (wire connected, local copy) as (0,0) (0,1) (1,0) (1,1).
use self::SounderMode as Sm;
use self::SynthMode as Sy;

const LOOP_MODES: [[SounderMode; 4]; 4] = [
    [Sm::Rec, Sm::Dis, Sm::Rec, Sm::Dis],
    [Sm::Rec, Sm::Slc, Sm::Rec, Sm::Efk],
    [Sm::Src, Sm::Dis, Sm::Src, Sm::Dis],
    [Sm::Src, Sm::Slc, Sm::Src, Sm::Efk],
];

const KS_MODES: [[SounderMode; 4]; 4] = [
    [Sm::Rec, Sm::Dis, Sm::Rec, Sm::Dis],
    [Sm::Rec, Sm::Slc, Sm::Rec, Sm::Fk],
    [Sm::Src, Sm::Dis, Sm::Src, Sm::Dis],
    [Sm::Src, Sm::Slc, Sm::Src, Sm::Fk],
];

const SYNTH_MODES: [[SynthMode; 4]; 4] = [
    [Sy::Rec, Sy::Dis, Sy::Rec, Sy::Dis],
    [Sy::Rec, Sy::Slc, Sy::Rec, Sy::Fk],
    [Sy::Src, Sy::Dis, Sy::Src, Sy::Dis],
    [Sy::Src, Sy::Slc, Sy::Src, Sy::Fk],
];

pub type KeyCallback = Box<dyn Fn(Vec<i32>) + Send + Sync>;
pub type ErrMsgCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct KobParams {
    pub interface_type: InterfaceType,
    pub serial_port: Option<String>,
    pub use_gpio: bool,
    pub use_audio: bool,
    pub audio_type: AudioType,
    pub tone_hz: f32,
    pub volume: f32,
    pub use_sounder: bool,
    pub invert_key_input: bool,
    pub sound_local: bool,
    pub sounder_power_save: Duration,
    /// The owning code drives the virtual closer itself.
    pub virtual_closer_in_use: bool,
}

impl Default for KobParams {
    fn default() -> Self {
        Self {
            interface_type: InterfaceType::Loop,
            serial_port: None,
            use_gpio: false,
            use_audio: false,
            audio_type: AudioType::Sounder,
            tone_hz: 620.0,
            volume: 0.7,
            use_sounder: false,
            invert_key_input: false,
            sound_local: true,
            sounder_power_save: Duration::ZERO,
            virtual_closer_in_use: false,
        }
    }
}

struct SounderState {
    hw: Hw,
    interface_type: InterfaceType,
    invert_key_input: bool,
    use_sounder: bool,
    sound_local: bool,
    power_save_after: Duration,
    key_closer_is_open: bool,
    virtual_closer_is_open: bool,
    circuit_is_closed: bool,
    internet_circuit_closed: bool,
    wire_connected: bool,
    power_saving: bool,
    ps_energize_sounder: bool,
    sounder_energized: bool,
    t_sounder_energized: Option<Instant>,
    sounder_mode: SounderMode,
    synth_mode: SynthMode,
    t_key_last_change: Instant,
    key_state_last_closed: bool,
}

struct AudioState {
    audio: Option<Box<dyn AudioOutput>>,
    synth_energized: bool,
    audio_type: AudioType,
    use_audio: bool,
}

struct Inner {
    sounder: Mutex<SounderState>,
    audio: Mutex<AudioState>,
    keyer: Keyer,
    virtual_closer_in_use: bool,
    err_msg: ErrMsgCallback,
    key_callback: Option<KeyCallback>,
    t_soundcode: Mutex<Option<Instant>>,
    shutdown: Event,
    threads_stop: Event,
}

/// The key/sounder driver: owns the hardware interface, the synth sounder,
/// the keyer, and the threads that service them.
pub struct Kob {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Kob {
    pub fn new(
        params: KobParams,
        err_msg: ErrMsgCallback,
        key_callback: Option<KeyCallback>,
    ) -> Self {
        let audio = AudioState {
            audio: if params.use_audio {
                Some(create_audio(params.audio_type, params.tone_hz, params.volume))
            } else {
                None
            },
            synth_energized: false,
            audio_type: params.audio_type,
            use_audio: params.use_audio,
        };
        let hw = hardware::open(params.use_gpio, params.serial_port.as_deref(), &*err_msg);
        let mut sounder = SounderState {
            hw,
            interface_type: params.interface_type,
            invert_key_input: params.invert_key_input,
            use_sounder: params.use_sounder,
            sound_local: params.sound_local,
            power_save_after: params.sounder_power_save,
            key_closer_is_open: true,
            virtual_closer_is_open: true,
            circuit_is_closed: false,
            internet_circuit_closed: false,
            wire_connected: false,
            power_saving: false,
            ps_energize_sounder: false,
            sounder_energized: false,
            t_sounder_energized: None,
            sounder_mode: SounderMode::Dis,
            synth_mode: SynthMode::Dis,
            t_key_last_change: Instant::now(),
            key_state_last_closed: false,
        };
        // Read the key once to initialize the closer states.
        let invert = sounder.invert_key_input;
        let key_closed = sounder.hw.is_available()
            && sounder.hw.read_key().map(|v| v != invert).unwrap_or(false);
        sounder.circuit_is_closed = key_closed;
        sounder.key_state_last_closed = key_closed;
        sounder.key_closer_is_open = !key_closed;
        sounder.virtual_closer_is_open = !key_closed;

        let inner = Arc::new(Inner {
            sounder: Mutex::new(sounder),
            audio: Mutex::new(audio),
            keyer: Keyer::new(crate::morse::Sender::DOT_LEN_20WPM),
            virtual_closer_in_use: params.virtual_closer_in_use,
            err_msg,
            key_callback,
            t_soundcode: Mutex::new(None),
            shutdown: Event::new(),
            threads_stop: Event::new(),
        });
        update_modes(&inner);

        let kob = Self {
            inner,
            threads: Mutex::new(Vec::new()),
        };
        kob.start_hw_processing();
        kob
    }

    fn start_hw_processing(&self) {
        if self.inner.shutdown.is_set() {
            return;
        }
        self.inner.threads_stop.clear();
        power_save(&self.inner, false);
        let mut threads = self.threads.lock().unwrap();
        let hw_available = self.inner.sounder.lock().unwrap().hw.is_available();
        let interface = self.inner.sounder.lock().unwrap().interface_type;
        if self.inner.key_callback.is_some() {
            let inner = Arc::clone(&self.inner);
            threads.push(
                thread::Builder::new()
                    .name("kob-keyer".into())
                    .spawn(move || thread_keyer_body(&inner))
                    .expect("spawn keyer thread"),
            );
            if hw_available {
                let inner = Arc::clone(&self.inner);
                if interface == InterfaceType::Keyer {
                    threads.push(
                        thread::Builder::new()
                            .name("kob-paddle".into())
                            .spawn(move || thread_paddle_body(&inner))
                            .expect("spawn paddle thread"),
                    );
                } else {
                    threads.push(
                        thread::Builder::new()
                            .name("kob-keyread".into())
                            .spawn(move || thread_keyread_body(&inner))
                            .expect("spawn keyread thread"),
                    );
                }
            }
        }
        if hw_available {
            let inner = Arc::clone(&self.inner);
            threads.push(
                thread::Builder::new()
                    .name("kob-powersave".into())
                    .spawn(move || thread_powersave_body(&inner))
                    .expect("spawn powersave thread"),
            );
        }
    }

    fn stop_hw_processing(&self) {
        self.inner.threads_stop.set();
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    // ── Closers / flags ──────────────────────────────────────────────────────

    pub fn virtual_closer_is_open(&self) -> bool {
        self.inner.sounder.lock().unwrap().virtual_closer_is_open
    }

    pub fn set_virtual_closer_open(&self, open: bool) {
        set_virtual_closer_open(&self.inner, open);
    }

    pub fn key_closer_is_open(&self) -> bool {
        self.inner.sounder.lock().unwrap().key_closer_is_open
    }

    pub fn wire_connected(&self) -> bool {
        self.inner.sounder.lock().unwrap().wire_connected
    }

    pub fn set_wire_connected(&self, connected: bool) {
        let changed = {
            let mut st = self.inner.sounder.lock().unwrap();
            let changed = st.wire_connected != connected;
            st.wire_connected = connected;
            changed
        };
        if changed {
            update_modes(&self.inner);
        }
    }

    pub fn set_internet_circuit_closed(&self, closed: bool) {
        self.inner.sounder.lock().unwrap().internet_circuit_closed = closed;
    }

    pub fn sound_local(&self) -> bool {
        self.inner.sounder.lock().unwrap().sound_local
    }

    pub fn set_sound_local(&self, on: bool) {
        let changed = {
            let mut st = self.inner.sounder.lock().unwrap();
            let changed = st.sound_local != on;
            st.sound_local = on;
            changed
        };
        if changed {
            update_modes(&self.inner);
        }
    }

    pub fn set_use_sounder(&self, use_sounder: bool) {
        let changed = {
            let mut st = self.inner.sounder.lock().unwrap();
            let changed = st.use_sounder != use_sounder;
            st.use_sounder = use_sounder;
            changed
        };
        if changed {
            update_modes(&self.inner);
        }
    }

    pub fn sounder_is_power_saving(&self) -> bool {
        self.inner.sounder.lock().unwrap().power_saving
    }

    pub fn set_sounder_power_save(&self, after: Duration) {
        self.inner.sounder.lock().unwrap().power_save_after = after;
    }

    pub fn sounder_is_energized(&self) -> bool {
        self.inner.sounder.lock().unwrap().sounder_energized
    }

    pub fn paddle_supported(&self) -> bool {
        self.inner.sounder.lock().unwrap().hw.paddle_supported()
    }

    pub fn hardware_available(&self) -> bool {
        self.inner.sounder.lock().unwrap().hw.is_available()
    }

    // ── Keyer ────────────────────────────────────────────────────────────────

    pub fn keyer_mode_set(&self, mode: KeyerMode, source: CodeSource) {
        self.inner.keyer.set_mode(mode, source);
    }

    pub fn set_keyer_dit_len(&self, dit_len: i32) {
        self.inner.keyer.set_dit_len(dit_len);
    }

    // ── Sounding ─────────────────────────────────────────────────────────────

    /// Set the state of the sounder, physical and synth, for sounding code.
    pub fn energize_sounder(&self, energize: bool, source: CodeSource, from_disconnect: bool) {
        energize_sounder(&self.inner, energize, source, from_disconnect);
    }

    /// Process a code sequence and sound it. With `sound` false this only
    /// spends the time the code represents.
    pub fn sound_code(&self, code: &[i32], source: CodeSource, sound: bool) {
        sound_code(&self.inner, code, source, sound);
    }

    pub fn power_save(&self, enable: bool) {
        power_save(&self.inner, enable);
    }

    // ── Reconfiguration ──────────────────────────────────────────────────────

    /// Change the hardware from what it was at initialization.
    pub fn change_hardware(
        &self,
        interface_type: InterfaceType,
        serial_port: Option<&str>,
        use_gpio: bool,
        use_sounder: bool,
    ) {
        if self.inner.shutdown.is_set() {
            return;
        }
        self.stop_hw_processing();
        {
            let mut st = self.inner.sounder.lock().unwrap();
            st.interface_type = interface_type;
            st.use_sounder = use_sounder;
            st.hw = hardware::open(use_gpio, serial_port, &*self.inner.err_msg);
        }
        update_modes(&self.inner);
        self.start_hw_processing();
    }

    /// Change the audio settings from what they were at initialization.
    pub fn change_audio(&self, use_audio: bool, audio_type: AudioType, tone_hz: f32, volume: f32) {
        if self.inner.shutdown.is_set() {
            return;
        }
        {
            let mut au = self.inner.audio.lock().unwrap();
            au.use_audio = use_audio;
            au.audio_type = audio_type;
            au.synth_energized = false;
            au.audio = if use_audio {
                Some(create_audio(audio_type, tone_hz, volume))
            } else {
                None
            };
        }
        update_modes(&self.inner);
    }

    /// Stop the threads and release the hardware. Idempotent.
    pub fn exit(&self) {
        self.inner.shutdown.set();
        self.stop_hw_processing();
        let mut st = self.inner.sounder.lock().unwrap();
        let _ = st.hw.set_sounder(false);
        st.hw = Hw::None;
    }
}

impl Drop for Kob {
    fn drop(&mut self) {
        self.exit();
    }
}

// ── Mode selection ───────────────────────────────────────────────────────────

fn update_modes(inner: &Inner) {
    if inner.shutdown.is_set() {
        return;
    }
    let energize = {
        let mut st = inner.sounder.lock().unwrap();
        let col = 2 * st.key_closer_is_open as usize + st.virtual_closer_is_open as usize;
        let row = 2 * st.wire_connected as usize + st.sound_local as usize;
        let tbl = if st.interface_type == InterfaceType::Loop {
            &LOOP_MODES
        } else {
            &KS_MODES
        };
        st.sounder_mode = if st.hw.is_available() {
            tbl[row][col]
        } else {
            SounderMode::Dis
        };
        st.synth_mode = SYNTH_MODES[row][col];
        log::debug!(
            "kob modes: sounder={:?} synth={:?}",
            st.sounder_mode,
            st.synth_mode
        );
        // When idle with the circuit closed the sounder sits energized,
        // unless a connected wire's remote circuit is open.
        let energize = (!st.virtual_closer_is_open && !st.wire_connected)
            || (st.wire_connected && st.internet_circuit_closed && !st.virtual_closer_is_open);
        let efk = st.sounder_mode == SounderMode::Efk;
        energize_hw_sounder(&mut st, energize || efk, &inner.err_msg);
        energize
    };
    let mut au = inner.audio.lock().unwrap();
    energize_synth(&mut au, energize, true, &inner.err_msg);
}

fn energize_hw_sounder(st: &mut SounderState, energize: bool, err: &ErrMsgCallback) {
    let hw_energize = energize && st.use_sounder;
    if st.sounder_energized != hw_energize {
        st.t_sounder_energized = if hw_energize { Some(Instant::now()) } else { None };
        st.sounder_energized = hw_energize;
        if let Err(e) = st.hw.set_sounder(hw_energize) {
            st.hw = Hw::None;
            err(&format!(
                "Hardware error setting sounder state: {e}. Disabling interface."
            ));
        }
    }
}

fn energize_synth(au: &mut AudioState, energize: bool, no_tone: bool, err: &ErrMsgCallback) {
    if !au.use_audio {
        return;
    }
    let result = if energize {
        if no_tone {
            // click only (impact voice); the tone stays silent
            if au.audio_type == AudioType::Sounder && !au.synth_energized {
                au.synth_energized = true;
                au.audio.as_mut().map(|a| a.play_mark())
            } else {
                None
            }
        } else if !au.synth_energized {
            au.synth_energized = true;
            au.audio.as_mut().map(|a| a.play_mark())
        } else {
            None
        }
    } else if au.synth_energized {
        au.synth_energized = false;
        au.audio.as_mut().map(|a| a.play_space())
    } else {
        None
    };
    if let Some(Err(e)) = result {
        au.use_audio = false;
        au.audio = None;
        err(&format!(
            "System audio error playing sounder state: {e}. Disabling synth sounder."
        ));
    }
}

fn energize_sounder(inner: &Inner, energize: bool, source: CodeSource, from_disconnect: bool) {
    if inner.shutdown.is_set() || source == CodeSource::ModeChange {
        return;
    }
    let local_source = source != CodeSource::Wire;
    let synth_mode = {
        let mut st = inner.sounder.lock().unwrap();
        if !(st.sounder_mode == SounderMode::Dis || st.sounder_mode == SounderMode::Efk) {
            let drive = if local_source {
                st.sounder_mode != SounderMode::Src || from_disconnect
            } else {
                st.sounder_mode == SounderMode::Src
            };
            if drive {
                energize_hw_sounder(&mut st, energize, &inner.err_msg);
            }
        }
        st.synth_mode
    };
    let mut au = inner.audio.lock().unwrap();
    if synth_mode != SynthMode::Dis {
        let drive = if local_source {
            synth_mode != SynthMode::Src || from_disconnect
        } else {
            synth_mode == SynthMode::Src
        };
        if drive {
            energize_synth(&mut au, energize, from_disconnect, &inner.err_msg);
        }
    }
}

fn power_save(inner: &Inner, enable: bool) {
    if inner.shutdown.is_set() {
        return;
    }
    let mut st = inner.sounder.lock().unwrap();
    // Power save only applies while sounding remote code or a recording.
    if enable
        && matches!(
            st.sounder_mode,
            SounderMode::Dis | SounderMode::Efk | SounderMode::Fk
        )
    {
        return;
    }
    if enable == st.power_saving {
        return;
    }
    if enable {
        log::debug!("sounder power-save on");
        st.ps_energize_sounder = st.sounder_energized;
        energize_hw_sounder(&mut st, false, &inner.err_msg);
        st.power_saving = true;
    } else {
        log::debug!("sounder power-save off");
        st.power_saving = false;
        if st.ps_energize_sounder {
            energize_hw_sounder(&mut st, true, &inner.err_msg);
        }
        st.ps_energize_sounder = false;
    }
}

fn set_virtual_closer_open(inner: &Inner, open: bool) {
    let changed = {
        let mut st = inner.sounder.lock().unwrap();
        let changed = st.virtual_closer_is_open != open;
        st.virtual_closer_is_open = open;
        changed
    };
    if changed {
        // Any closer transition wakes the sounder from power save; the
        // closed position in particular must re-energize it.
        power_save(inner, false);
        update_modes(inner);
    }
}

fn set_key_closer_open(inner: &Inner, open: bool) {
    let changed = {
        let mut st = inner.sounder.lock().unwrap();
        if st.key_closer_is_open == open {
            false
        } else {
            st.key_closer_is_open = open;
            if !open && st.sounder_mode == SounderMode::Efk {
                // Closing the key closer on a loop: refresh the energized
                // time so power save does not kick in immediately.
                st.t_sounder_energized = Some(Instant::now());
            }
            if !inner.virtual_closer_in_use {
                // Have the virtual closer track the physical one.
                st.virtual_closer_is_open = open;
            }
            true
        }
    };
    if changed {
        if open {
            power_save(inner, false);
        }
        update_modes(inner);
    }
}

// ── Code sounding ────────────────────────────────────────────────────────────

fn sound_code(inner: &Inner, code: &[i32], source: CodeSource, sound: bool) {
    if inner.shutdown.is_set() {
        return;
    }
    if sound {
        power_save(inner, false);
    }
    for &element in code {
        if inner.threads_stop.is_set() {
            energize_sounder(inner, false, source, true);
            return;
        }
        let t = Instant::now();
        let c = if element < -3000 { -1 } else { element };
        if (c == LATCH || c > UNLATCH) && sound {
            energize_sounder(inner, true, source, false);
        }
        let dur = Duration::from_millis(c.unsigned_abs() as u64);
        let wait = {
            let mut last = inner.t_soundcode.lock().unwrap();
            let t_next = last.map(|l| l + dur);
            match t_next {
                Some(tn) if tn > t => {
                    *last = Some(tn);
                    Some(tn - t)
                }
                _ => {
                    *last = Some(t);
                    None
                }
            }
        };
        if let Some(dt) = wait {
            inner.threads_stop.wait(dt);
        }
        if c > LATCH && sound {
            // end of a non-latching mark
            energize_sounder(inner, false, source, false);
        }
    }
}

// ── Thread bodies ────────────────────────────────────────────────────────────

fn deliver_code(inner: &Inner, code: Vec<i32>) {
    if code.is_empty() {
        return;
    }
    match code.last() {
        Some(&LATCH) => set_key_closer_open(inner, false),
        Some(&UNLATCH) => set_key_closer_open(inner, true),
        _ => {}
    }
    if let Some(cb) = &inner.key_callback {
        if !inner.threads_stop.is_set() {
            cb(code);
        }
    }
}

fn thread_keyread_body(inner: &Inner) {
    while !inner.threads_stop.is_set() && !inner.shutdown.is_set() {
        {
            let st = inner.sounder.lock().unwrap();
            if !st.hw.is_available() {
                break;
            }
        }
        let code = read_key_sequence(inner);
        deliver_code(inner, code);
    }
    log::debug!("keyread thread done");
}

fn thread_keyer_body(inner: &Inner) {
    while !inner.threads_stop.is_set() && !inner.shutdown.is_set() {
        let code = keyer_sequence(inner);
        deliver_code(inner, code);
    }
    log::debug!("keyer thread done");
}

fn thread_paddle_body(inner: &Inner) {
    // Keyer interface: the two paddle contacts set the keyer mode instead
    // of producing code directly.
    while !inner.threads_stop.is_set() && !inner.shutdown.is_set() {
        let next = {
            let mut st = inner.sounder.lock().unwrap();
            if !st.hw.is_available() {
                break;
            }
            let invert = st.invert_key_input;
            let dit = match st.hw.read_key() {
                Ok(v) => v != invert,
                Err(e) => {
                    st.hw = Hw::None;
                    drop(st);
                    (inner.err_msg)(&format!(
                        "Hardware read error on paddle: {e}. Disabling interface."
                    ));
                    break;
                }
            };
            let dah = st.hw.read_paddle_dah().unwrap_or(false);
            if dit {
                KeyerMode::Dits
            } else if dah {
                KeyerMode::Dah
            } else {
                KeyerMode::Idle
            }
        };
        if next != inner.keyer.mode().0 {
            inner.keyer.set_mode(next, CodeSource::Key);
        }
        inner.threads_stop.wait(Duration::from_millis(2));
    }
    log::debug!("paddle thread done");
}

fn thread_powersave_body(inner: &Inner) {
    while !inner.threads_stop.is_set() && !inner.shutdown.is_set() {
        {
            let st = inner.sounder.lock().unwrap();
            let due = st.power_save_after > Duration::ZERO
                && !st.power_saving
                && st
                    .t_sounder_energized
                    .is_some_and(|t| t.elapsed() > st.power_save_after);
            drop(st);
            if due {
                power_save(inner, true);
            }
        }
        inner.threads_stop.wait(Duration::from_millis(500));
    }
    log::debug!("powersave thread done");
}

/// Process input from the key and return a code sequence. Blocks until a
/// sequence is complete, the hardware goes away, or a stop is requested.
fn read_key_sequence(inner: &Inner) -> Vec<i32> {
    let mut code: Vec<i32> = Vec::new();
    if inner.shutdown.is_set() {
        return code;
    }
    // The sleep time slowly stretches while the key is idle to cut CPU use.
    let mut no_change: u32 = 0;
    let mut sleep_time = Duration::from_micros(1000);
    let mut sleep_bump = Duration::from_micros(5000);
    while !inner.threads_stop.is_set() {
        let mut fk_drive = None;
        let (kc, circuit_closed, t_key_last, changed, dt) = {
            let mut st = inner.sounder.lock().unwrap();
            if !st.hw.is_available() {
                return code;
            }
            let invert = st.invert_key_input;
            let kc = match st.hw.read_key() {
                Ok(v) => v != invert,
                Err(e) => {
                    st.hw = Hw::None;
                    drop(st);
                    (inner.err_msg)(&format!(
                        "Hardware read error on key: {e}. Disabling interface."
                    ));
                    return code;
                }
            };
            let t = Instant::now();
            let changed = kc != st.key_state_last_closed;
            let mut dt = 0i32;
            if changed {
                st.key_state_last_closed = kc;
                dt = (t - st.t_key_last_change).as_millis() as i32;
                st.t_key_last_change = t;
                // For separate key & sounder (and the synth), drive the
                // sounder here to keep it as close to the key as possible.
                // A loop interface follows the key electrically.
                if st.sounder_mode == SounderMode::Fk || st.synth_mode == SynthMode::Fk {
                    fk_drive = Some(kc);
                } else if st.sounder_mode == SounderMode::Efk && st.use_sounder && kc {
                    st.t_sounder_energized = Some(t);
                }
            }
            (kc, st.circuit_is_closed, st.t_key_last_change, changed, dt)
        };
        let t = Instant::now();
        if changed {
            if let Some(energize) = fk_drive {
                energize_sounder(inner, energize, CodeSource::Key, false);
            }
            inner.threads_stop.wait(DEBOUNCE);
            if kc {
                code.push(-dt);
            } else if circuit_closed {
                code.push(-dt);
                code.push(UNLATCH); // unlatch the closed circuit
                inner.sounder.lock().unwrap().circuit_is_closed = false;
                return code;
            } else {
                code.push(dt);
            }
            no_change = 0;
            sleep_time = Duration::from_micros(1000);
            sleep_bump = Duration::from_micros(5000);
        } else if sleep_time < Duration::from_millis(25) {
            no_change += 1;
            if no_change % 1000 == 0 {
                sleep_time += sleep_bump;
                sleep_bump += sleep_bump;
            }
        }
        if !kc && !code.is_empty() && t > t_key_last + CODE_SPACE {
            return code;
        }
        if kc && !circuit_closed && t > t_key_last + CKT_CLOSE {
            code.push(LATCH); // latch the circuit closed
            inner.sounder.lock().unwrap().circuit_is_closed = true;
            return code;
        }
        if code.len() >= MAX_CODE_ELEMENTS {
            return code;
        }
        inner.threads_stop.wait(sleep_time);
    }
    code
}

/// Generate a code sequence from the keyer mode and its changes.
fn keyer_sequence(inner: &Inner) -> Vec<i32> {
    let mut code: Vec<i32> = Vec::new();
    if inner.shutdown.is_set() {
        return code;
    }
    let mut km1 = inner.keyer.mode();
    let mut no_change: u32 = 0;
    let mut sleep_time = Duration::from_micros(1000);
    let mut sleep_bump = Duration::from_micros(5000);
    while !inner.threads_stop.is_set() {
        let drive_sounder = {
            let st = inner.sounder.lock().unwrap();
            st.sounder_mode == SounderMode::Fk
                || st.sounder_mode == SounderMode::Slc
                || st.synth_mode == SynthMode::Fk
                || st.synth_mode == SynthMode::Slc
        };
        let km = inner.keyer.mode();
        let dit_len = inner.keyer.dit_len();
        let mut t = Instant::now();
        let circuit_closed = inner.sounder.lock().unwrap().circuit_is_closed;
        let (t_mode_change, dits_down) = {
            let ks = inner.keyer.state.lock().unwrap();
            (ks.t_mode_change, ks.dits_down)
        };
        if km.0 == km1.0 && km.0 == KeyerMode::Dits {
            // Still generating dits: a full down or up half-cycle each pass.
            if drive_sounder {
                energize_sounder(inner, dits_down, km.1, false);
            }
            inner
                .threads_stop
                .wait(Duration::from_millis(dit_len as u64));
            code.push(if dits_down { dit_len } else { -dit_len });
            inner.keyer.state.lock().unwrap().dits_down = !dits_down;
            t = Instant::now();
        } else if km.0 != km1.0 {
            // Mode changed. A transition out of dits closes the in-flight
            // half-cycle at one dit length.
            let km2 = km1;
            km1 = km;
            let dt = if km2.0 == KeyerMode::Dits {
                dit_len
            } else {
                ((t - t_mode_change).as_millis() as i32 - 8).max(1)
            };
            inner.keyer.state.lock().unwrap().t_mode_change = t;
            if km.0 == KeyerMode::Dits {
                inner.keyer.state.lock().unwrap().dits_down = true;
            } else {
                inner.keyer.state.lock().unwrap().dits_down = false;
                if drive_sounder {
                    energize_sounder(inner, km.0 == KeyerMode::Dah, CodeSource::Key, false);
                }
            }
            if km.0 == KeyerMode::Idle {
                if circuit_closed {
                    code.push(-dt);
                    code.push(UNLATCH);
                    inner.sounder.lock().unwrap().circuit_is_closed = false;
                    return code;
                } else if km2.0 == KeyerMode::Dits {
                    return code;
                } else {
                    code.push(dt);
                }
            } else {
                code.push(-dt);
            }
            no_change = 0;
            sleep_time = Duration::from_micros(1000);
            sleep_bump = Duration::from_micros(5000);
        } else if sleep_time < Duration::from_millis(30) {
            no_change += 1;
            if no_change % 1000 == 0 {
                sleep_time += sleep_bump;
                sleep_bump += sleep_bump;
            }
        }
        let t_mode_change = inner.keyer.state.lock().unwrap().t_mode_change;
        if km.0 == KeyerMode::Idle && !code.is_empty() && t > t_mode_change + CODE_SPACE {
            return code;
        }
        if km.0 == KeyerMode::Dah && !circuit_closed && t > t_mode_change + CKT_CLOSE {
            code.push(LATCH);
            inner.sounder.lock().unwrap().circuit_is_closed = true;
            return code;
        }
        if code.len() >= MAX_CODE_ELEMENTS {
            return code;
        }
        if km.0 != KeyerMode::Dits {
            // idle and dah both pace on the bounded sleep
            inner.threads_stop.wait(sleep_time);
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_kob(params: KobParams) -> Kob {
        Kob::new(params, Box::new(|m| log::debug!("{m}")), None)
    }

    #[test]
    fn mode_tables_match_policy() {
        // (wire, local) rows x (key open, virtual open) cols
        // Idle with everything closed on a dead wire sounds recordings.
        assert_eq!(LOOP_MODES[0][0], SounderMode::Rec);
        // Local copy with both closers open on a loop powers the sounder.
        assert_eq!(LOOP_MODES[1][3], SounderMode::Efk);
        // Key & sounder follows the key instead.
        assert_eq!(KS_MODES[1][3], SounderMode::Fk);
        // Connected wire with closers closed sounds remote code.
        assert_eq!(LOOP_MODES[2][0], SounderMode::Src);
        assert_eq!(KS_MODES[3][0], SounderMode::Src);
        // No local copy suppresses local sounding entirely.
        for row in [0, 2] {
            assert_eq!(KS_MODES[row][1], SounderMode::Dis);
            assert_eq!(KS_MODES[row][3], SounderMode::Dis);
        }
        // Synth table mirrors the key & sounder table.
        for r in 0..4 {
            for c in 0..4 {
                let want = match KS_MODES[r][c] {
                    SounderMode::Dis => SynthMode::Dis,
                    SounderMode::Fk | SounderMode::Efk => SynthMode::Fk,
                    SounderMode::Slc => SynthMode::Slc,
                    SounderMode::Rec => SynthMode::Rec,
                    SounderMode::Src => SynthMode::Src,
                };
                assert_eq!(SYNTH_MODES[r][c], want);
            }
        }
    }

    #[test]
    fn sound_code_spends_the_right_time() {
        let kob = quiet_kob(KobParams::default());
        let start = Instant::now();
        kob.sound_code(&[-60, 60, -60, 180], CodeSource::Local, false);
        // The first element anchors the deadline; the rest spend 300 ms.
        let spent = start.elapsed();
        assert!(spent >= Duration::from_millis(295), "spent {spent:?}");
        assert!(spent < Duration::from_millis(900), "spent {spent:?}");
        // Deadline-based pacing: a second call continues from the last
        // deadline, never sleeping for negative intervals.
        kob.sound_code(&[-60, 60], CodeSource::Local, false);
        kob.exit();
    }

    #[test]
    fn long_gaps_are_renormalized() {
        let kob = quiet_kob(KobParams::default());
        let start = Instant::now();
        kob.sound_code(&[-20000, 60], CodeSource::Local, false);
        // -20000 collapses to -1 rather than a 20 second stall.
        assert!(start.elapsed() < Duration::from_secs(2));
        kob.exit();
    }

    #[test]
    fn virtual_closer_is_idempotent() {
        let kob = quiet_kob(KobParams::default());
        kob.set_virtual_closer_open(false);
        let mode1 = {
            let st = kob.inner.sounder.lock().unwrap();
            (st.sounder_mode, st.synth_mode, st.virtual_closer_is_open)
        };
        kob.set_virtual_closer_open(false);
        let mode2 = {
            let st = kob.inner.sounder.lock().unwrap();
            (st.sounder_mode, st.synth_mode, st.virtual_closer_is_open)
        };
        assert_eq!(mode1, mode2);
        kob.exit();
    }

    #[test]
    fn exit_is_idempotent() {
        let kob = quiet_kob(KobParams::default());
        kob.exit();
        kob.exit();
        kob.sound_code(&[60], CodeSource::Local, true); // no-op after shutdown
    }
}
