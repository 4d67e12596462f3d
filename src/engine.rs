// src/engine.rs - the flow of Morse code through the program
//
// Binds the encoder, decoder, key/sounder driver, wire client, recorder and
// player into a single engine with one logical local sender. Local sources
// (key, keyboard, keyer, player) are serialized through a bounded emit queue
// with a single consumer; remote code arrives through the wire client's read
// thread.
use crate::config::{change_type, Config};
use crate::error::{Error, Result};
use crate::kob::{KeyerMode, Kob, KobParams};
use crate::morse::{
    CodeSeq, CodeSource, CodeType, Reader, Sender, Spacing, LATCH, LATCH_CODE, UNLATCH,
    UNLATCH_CODE,
};
use crate::recorder::{
    add_ext_if_needed, generate_session_recording_name, PlaybackInfo, PlaybackState,
    PlayerCallbacks, Recorder,
};
use crate::sync::Event;
use crate::wire::{WireCallbacks, WireClient};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Delay before the disconnect follow-up latches and flushes the decoder.
const DISCONNECT_FOLLOWUP: Duration = Duration::from_millis(800);
/// Bound on the local-emit FIFO.
const EMIT_QUEUE_DEPTH: usize = 16;

pub type TextCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct EngineCallbacks {
    /// Formatted decoded text (spacing and paragraph breaks applied).
    pub text: Option<TextCallback>,
    /// The current sender changed.
    pub sender: Option<TextCallback>,
    /// A station was heard on the wire.
    pub station: Option<TextCallback>,
    /// Status and error messages for the user.
    pub status: Option<TextCallback>,
}

enum EmitMsg {
    Code {
        code: CodeSeq,
        source: CodeSource,
        closer_open: bool,
        done: Option<Box<dyn FnOnce() + Send>>,
    },
    Shutdown,
}

struct Shared {
    cfg: Mutex<Config>,
    callbacks: EngineCallbacks,
    msender: Mutex<Sender>,
    mreader: Mutex<Option<Arc<Reader>>>,
    kob: OnceLock<Arc<Kob>>,
    wire: OnceLock<Arc<WireClient>>,
    recorder: Mutex<Option<Arc<Recorder>>>,
    player: Mutex<Option<Arc<Recorder>>>,
    connected: Event,
    internet_station_active: AtomicBool,
    sender_id: Mutex<String>,
    last_char_was_paragraph: AtomicBool,
    morse_params: Mutex<(CodeType, u16, u16, Spacing)>,
    emit_tx: Mutex<Option<mpsc::SyncSender<EmitMsg>>>,
    kb_tx: Mutex<Option<mpsc::Sender<char>>>,
    kb_gate: Event,
    odc_pending: AtomicBool,
    shutdown: Event,
}

/// The telegraphy engine. Owns every subsystem; see module docs.
pub struct Engine {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(cfg: Config, callbacks: EngineCallbacks) -> Result<Self> {
        let morse_params = (
            cfg.code_type,
            cfg.min_char_speed.max(cfg.text_speed),
            cfg.text_speed,
            cfg.spacing,
        );
        let msender = Sender::new(
            cfg.text_speed,
            cfg.min_char_speed,
            cfg.code_type,
            cfg.spacing,
        );
        let shared = Arc::new(Shared {
            cfg: Mutex::new(cfg),
            callbacks,
            msender: Mutex::new(msender),
            mreader: Mutex::new(None),
            kob: OnceLock::new(),
            wire: OnceLock::new(),
            recorder: Mutex::new(None),
            player: Mutex::new(None),
            connected: Event::new(),
            internet_station_active: AtomicBool::new(false),
            sender_id: Mutex::new(String::new()),
            last_char_was_paragraph: AtomicBool::new(false),
            morse_params: Mutex::new(morse_params),
            emit_tx: Mutex::new(None),
            kb_tx: Mutex::new(None),
            kb_gate: Event::new(),
            odc_pending: AtomicBool::new(false),
            shutdown: Event::new(),
        });

        // Decoder, with its character callback feeding the text sink.
        {
            let (ct, cwpm, twpm, _) = *shared.morse_params.lock().unwrap();
            let dad = shared.cfg.lock().unwrap().decode_at_detected;
            let reader = build_reader(&shared, twpm, cwpm, ct, dad);
            *shared.mreader.lock().unwrap() = Some(reader);
        }

        // Key/sounder driver; its key callback routes into the emit queue.
        {
            let c = shared.cfg.lock().unwrap().clone();
            let weak = Arc::downgrade(&shared);
            let key_cb: crate::kob::KeyCallback = Box::new(move |code| {
                if let Some(s) = weak.upgrade() {
                    from_key(&s, code);
                }
            });
            let weak = Arc::downgrade(&shared);
            let err_cb: crate::kob::ErrMsgCallback = Box::new(move |msg| {
                log::warn!("{msg}");
                if let Some(s) = weak.upgrade() {
                    if let Some(cb) = &s.callbacks.status {
                        cb(msg);
                    }
                }
            });
            let kob = Arc::new(Kob::new(
                KobParams {
                    interface_type: c.interface_type,
                    // An empty port with serial enabled means autodetect the
                    // dedicated adapter by its USB serial number.
                    serial_port: if c.use_serial {
                        if c.serial_port.is_empty() {
                            crate::kob::hardware::find_adapter_port()
                        } else {
                            Some(c.serial_port.clone())
                        }
                    } else {
                        None
                    },
                    use_gpio: c.use_gpio,
                    use_audio: c.sound,
                    audio_type: c.audio_type,
                    tone_hz: c.tone_hz as f32,
                    volume: c.volume,
                    use_sounder: c.sounder,
                    invert_key_input: c.invert_key_input,
                    sound_local: c.local,
                    sounder_power_save: Duration::from_secs(c.sounder_power_save as u64),
                    virtual_closer_in_use: true,
                },
                err_cb,
                Some(key_cb),
            ));
            let dit = 1200 / shared.morse_params.lock().unwrap().1.max(1) as i32;
            kob.set_keyer_dit_len(dit);
            let _ = shared.kob.set(kob);
        }

        // Wire client with its observers.
        {
            let c = shared.cfg.lock().unwrap().clone();
            let w_code = Arc::downgrade(&shared);
            let w_sender = Arc::downgrade(&shared);
            let w_station = Arc::downgrade(&shared);
            let w_disc = Arc::downgrade(&shared);
            let wire = Arc::new(WireClient::new(
                &c.server_url,
                &c.station,
                WireCallbacks {
                    code: Some(Box::new(move |code| {
                        if let Some(s) = w_code.upgrade() {
                            from_wire(&s, code);
                        }
                    })),
                    sender: Some(Box::new(move |id| {
                        if let Some(s) = w_sender.upgrade() {
                            update_sender(&s, id);
                        }
                    })),
                    station: Some(Box::new(move |id| {
                        if let Some(s) = w_station.upgrade() {
                            if let Some(cb) = &s.callbacks.station {
                                cb(id);
                            }
                        }
                    })),
                    disconnected: Some(Box::new(move || {
                        if let Some(s) = w_disc.upgrade() {
                            s.connected.clear();
                            kob(&s).set_wire_connected(false);
                            on_disconnect(&s);
                        }
                    })),
                },
            )?);
            let _ = shared.wire.set(wire);
        }

        Ok(Self {
            shared,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Start the emit and keyboard-send threads; auto-connect if configured.
    pub fn start(&self) {
        let (emit_tx, emit_rx) = mpsc::sync_channel(EMIT_QUEUE_DEPTH);
        *self.shared.emit_tx.lock().unwrap() = Some(emit_tx);
        let (kb_tx, kb_rx) = mpsc::channel();
        *self.shared.kb_tx.lock().unwrap() = Some(kb_tx);
        let mut threads = self.threads.lock().unwrap();
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("engine-emit".into())
                .spawn(move || emit_thread_run(&shared, emit_rx))
                .expect("spawn emit thread"),
        );
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("engine-keyboard".into())
                .spawn(move || kb_thread_run(&shared, kb_rx))
                .expect("spawn keyboard thread"),
        );
        drop(threads);
        if self.shared.cfg.lock().unwrap().auto_connect {
            if let Err(e) = self.connect() {
                log::warn!("auto-connect failed: {e}");
            }
        }
    }

    // ── Wire session ─────────────────────────────────────────────────────────

    pub fn connect(&self) -> Result<()> {
        connect(&self.shared)
    }

    pub fn disconnect(&self) {
        disconnect(&self.shared);
    }

    pub fn toggle_connect(&self) -> Result<()> {
        if self.shared.connected.is_set() {
            self.disconnect();
            Ok(())
        } else {
            self.connect()
        }
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.is_set()
    }

    /// Change the current wire, reconnecting if connected.
    pub fn change_wire(&self, wire_no: u16) -> Result<()> {
        let was_connected = self.shared.connected.is_set();
        let changed = {
            let mut cfg = self.shared.cfg.lock().unwrap();
            let changed = cfg.wire != wire_no;
            cfg.wire = wire_no;
            changed
        };
        if changed && was_connected {
            self.disconnect();
            // allow in-flight datagrams to clear before rejoining
            self.shared.shutdown.wait(Duration::from_millis(500));
            return self.connect();
        }
        Ok(())
    }

    pub fn stations(&self) -> Vec<String> {
        wire(&self.shared).stations()
    }

    pub fn current_sender(&self) -> String {
        self.shared.sender_id.lock().unwrap().clone()
    }

    pub fn internet_station_active(&self) -> bool {
        self.shared.internet_station_active.load(Ordering::SeqCst)
    }

    /// Regain control of the wire.
    pub fn reset_wire_state(&self) {
        self.shared
            .internet_station_active
            .store(false, Ordering::SeqCst);
    }

    // ── Morse parameters ─────────────────────────────────────────────────────

    pub fn set_morse(&self, code_type: CodeType, cwpm: u16, twpm: u16, spacing: Spacing) {
        set_morse(&self.shared, code_type, cwpm, twpm, spacing);
    }

    pub fn set_speed(&self, cwpm: u16, twpm: u16) {
        let (ct, _, _, sp) = *self.shared.morse_params.lock().unwrap();
        set_morse(&self.shared, ct, cwpm, twpm, sp);
    }

    pub fn set_spacing(&self, spacing: Spacing) {
        let (ct, cwpm, twpm, _) = *self.shared.morse_params.lock().unwrap();
        set_morse(&self.shared, ct, cwpm, twpm, spacing);
    }

    pub fn wpm(&self) -> u16 {
        self.shared.morse_params.lock().unwrap().1
    }

    pub fn detected_wpm(&self) -> u16 {
        reader(&self.shared).map(|r| r.detected_wpm()).unwrap_or(0)
    }

    // ── Local sources ────────────────────────────────────────────────────────

    /// Queue text for the keyboard sender.
    pub fn send_text(&self, text: &str) {
        let tx = self.shared.kb_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            for ch in text.chars() {
                let _ = tx.send(ch);
            }
        }
    }

    /// Inject paddle state into the keyer.
    pub fn set_paddle(&self, mode: KeyerMode) {
        kob(&self.shared).keyer_mode_set(mode, CodeSource::Key);
    }

    /// True when a physical key/sounder interface is bound and usable.
    pub fn hardware_available(&self) -> bool {
        kob(&self.shared).hardware_available()
    }

    pub fn virtual_closer_is_open(&self) -> bool {
        kob(&self.shared).virtual_closer_is_open()
    }

    /// Latch (`closed = true`) or unlatch the virtual closer.
    pub fn set_virtual_closer_closed(&self, closed: bool) {
        set_virtual_closer_closed(&self.shared, closed);
    }

    pub fn toggle_virtual_closer(&self) {
        let open = self.virtual_closer_is_open();
        set_virtual_closer_closed(&self.shared, open);
    }

    // ── Recording / playback ─────────────────────────────────────────────────

    /// Start recording the session. A name is generated when none is given.
    pub fn record_start(&self, name: Option<&str>) -> PathBuf {
        let filename = match name {
            Some(n) if !n.is_empty() => add_ext_if_needed(n),
            _ => generate_session_recording_name(),
        };
        let (station, wire_no) = {
            let c = self.shared.cfg.lock().unwrap();
            (c.station.clone(), c.wire)
        };
        let rec = Arc::new(Recorder::new(
            Some(Path::new(&filename)),
            None,
            &station,
            wire_no as i32,
            PlayerCallbacks {
                code: None,
                sender: None,
                wire: None,
                finished: None,
            },
        ));
        *self.shared.recorder.lock().unwrap() = Some(rec);
        log::info!("recording to '{filename}'");
        PathBuf::from(filename)
    }

    /// Stop recording; returns the file that was being written.
    pub fn record_end(&self) -> Option<PathBuf> {
        let rec = self.shared.recorder.lock().unwrap().take()?;
        rec.target_path()
    }

    pub fn recording(&self) -> bool {
        self.shared.recorder.lock().unwrap().is_some()
    }

    /// Play a recording to the sounder and decoder. Disconnects first.
    pub fn playback_start(
        &self,
        path: &Path,
        max_silence: Duration,
        speed_factor: u32,
    ) -> Result<PlaybackInfo> {
        disconnect(&self.shared);
        *self.shared.sender_id.lock().unwrap() = String::new();
        let w_code = Arc::downgrade(&self.shared);
        let w_sender = Arc::downgrade(&self.shared);
        let w_fin = Arc::downgrade(&self.shared);
        let wire_no = self.shared.cfg.lock().unwrap().wire;
        let player = Arc::new(Recorder::new(
            None,
            Some(path),
            "",
            wire_no as i32,
            PlayerCallbacks {
                code: Some(Box::new(move |code| {
                    if let Some(s) = w_code.upgrade() {
                        from_player(&s, code);
                    }
                })),
                sender: Some(Box::new(move |id| {
                    if let Some(s) = w_sender.upgrade() {
                        update_sender(&s, id);
                    }
                })),
                wire: None,
                finished: Some(Box::new(move || {
                    if let Some(s) = w_fin.upgrade() {
                        if let Some(cb) = &s.callbacks.status {
                            cb("Playback finished.");
                        }
                    }
                })),
            },
        ));
        let info =
            Recorder::playback_start(&player, max_silence, speed_factor).map_err(Error::Io)?;
        *self.shared.player.lock().unwrap() = Some(player);
        Ok(info)
    }

    pub fn playback_stop(&self) {
        if let Some(p) = self.shared.player.lock().unwrap().take() {
            p.playback_stop();
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.shared
            .player
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.playback_state())
            .unwrap_or(PlaybackState::Idle)
    }

    pub fn playback_pause_resume(&self) {
        if let Some(p) = self.shared.player.lock().unwrap().clone() {
            p.playback_pause_resume();
        }
    }

    pub fn playback_move_seconds(&self, seconds: i64) {
        if let Some(p) = self.shared.player.lock().unwrap().clone() {
            p.playback_move_seconds(seconds);
        }
    }

    pub fn playback_move_to_sender_begin(&self) {
        if let Some(p) = self.shared.player.lock().unwrap().clone() {
            p.playback_move_to_sender_begin();
        }
    }

    pub fn playback_move_to_sender_end(&self) {
        if let Some(p) = self.shared.player.lock().unwrap().clone() {
            p.playback_move_to_sender_end();
        }
    }

    // ── Reconfiguration ──────────────────────────────────────────────────────

    /// Apply a new configuration snapshot, rebinding only what changed.
    pub fn update_config(&self, new_cfg: Config) {
        let old = self.shared.cfg.lock().unwrap().clone();
        let ct = new_cfg.changes_from(&old);
        if ct == change_type::NONE {
            return;
        }
        {
            let mut cfg = self.shared.cfg.lock().unwrap();
            *cfg = new_cfg.clone();
        }
        if ct & change_type::HARDWARE != 0 {
            let k = kob(&self.shared);
            k.change_hardware(
                new_cfg.interface_type,
                if new_cfg.use_serial && !new_cfg.serial_port.is_empty() {
                    Some(new_cfg.serial_port.as_str())
                } else {
                    None
                },
                new_cfg.use_gpio,
                new_cfg.sounder,
            );
            k.change_audio(
                new_cfg.sound,
                new_cfg.audio_type,
                new_cfg.tone_hz as f32,
                new_cfg.volume,
            );
            k.set_sounder_power_save(Duration::from_secs(new_cfg.sounder_power_save as u64));
        }
        if ct & change_type::MORSE != 0 {
            set_morse(
                &self.shared,
                new_cfg.code_type,
                new_cfg.min_char_speed,
                new_cfg.text_speed,
                new_cfg.spacing,
            );
        }
        if ct & change_type::OPERATIONS != 0 {
            kob(&self.shared).set_sound_local(new_cfg.local);
            if new_cfg.wire != old.wire {
                let _ = self.change_wire(new_cfg.wire);
            }
        }
    }

    /// Stop everything. Idempotent; safe to call from any thread.
    pub fn exit(&self) {
        if self.shared.shutdown.is_set() {
            return;
        }
        self.shared.shutdown.set();
        self.shared.kb_gate.set();
        if let Some(tx) = self.shared.emit_tx.lock().unwrap().take() {
            let _ = tx.try_send(EmitMsg::Shutdown);
        }
        *self.shared.kb_tx.lock().unwrap() = None;
        if let Some(p) = self.shared.player.lock().unwrap().take() {
            p.exit();
        }
        *self.shared.recorder.lock().unwrap() = None;
        // Stop the sounder first so a wire read thread mid-sound aborts
        // promptly instead of playing out its code before the join.
        kob(&self.shared).exit();
        disconnect_quietly(&self.shared);
        wire(&self.shared).exit();
        if let Some(r) = self.shared.mreader.lock().unwrap().take() {
            drop(r);
        }
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.exit();
    }
}

// ── Component access ─────────────────────────────────────────────────────────

fn kob(shared: &Shared) -> &Arc<Kob> {
    shared.kob.get().expect("kob initialized in Engine::new")
}

fn wire(shared: &Shared) -> &Arc<WireClient> {
    shared.wire.get().expect("wire initialized in Engine::new")
}

fn reader(shared: &Shared) -> Option<Arc<Reader>> {
    shared.mreader.lock().unwrap().clone()
}

// ── Decoder plumbing ─────────────────────────────────────────────────────────

fn build_reader(
    shared: &Arc<Shared>,
    twpm: u16,
    cwpm: u16,
    code_type: CodeType,
    decode_at_detected: bool,
) -> Arc<Reader> {
    let weak = Arc::downgrade(shared);
    Arc::new(Reader::new(
        twpm,
        cwpm,
        code_type,
        decode_at_detected,
        Box::new(move |ch, spacing| {
            if let Some(s) = weak.upgrade() {
                reader_callback(&s, ch, spacing);
            }
        }),
    ))
}

/// Format decoded characters for the text sink: spacing factor to spaces,
/// a newline after each paragraph mark.
fn reader_callback(shared: &Arc<Shared>, chars: &str, spacing: f32) {
    record_code(shared, &[], CodeSource::Local, chars);
    let code_type = shared.cfg.lock().unwrap().code_type;
    let sp = if code_type == CodeType::American {
        (spacing - 0.25) / 1.25
    } else {
        spacing
    };
    let mut txt = if sp > 100.0 {
        if chars == "__" {
            String::new()
        } else {
            " * ".to_string()
        }
    } else if sp > 5.0 {
        "     ".to_string()
    } else {
        let n = ((sp + 0.5) as i32).max(0) as usize;
        " ".repeat(n)
    };
    if chars == "=" {
        shared
            .last_char_was_paragraph
            .store(true, Ordering::SeqCst);
    } else if shared
        .last_char_was_paragraph
        .swap(false, Ordering::SeqCst)
    {
        txt.push('\n');
    }
    txt.push_str(chars);
    if let Some(cb) = &shared.callbacks.text {
        cb(&txt);
    }
}

fn update_sender(shared: &Arc<Shared>, id: &str) {
    let changed = {
        let mut cur = shared.sender_id.lock().unwrap();
        if *cur == id {
            false
        } else {
            *cur = id.to_string();
            true
        }
    };
    if changed {
        if let Some(cb) = &shared.callbacks.sender {
            cb(id);
        }
    }
}

/// Recording is disabled while a playback from this engine is running.
fn record_code(shared: &Arc<Shared>, code: &[i32], source: CodeSource, text: &str) {
    if let Some(p) = shared.player.lock().unwrap().clone() {
        if p.playback_state() != PlaybackState::Idle {
            return;
        }
    }
    if let Some(rec) = shared.recorder.lock().unwrap().clone() {
        rec.record(code, source, text);
    }
}

// ── Local emit pipeline ──────────────────────────────────────────────────────

fn emit_code(
    shared: &Arc<Shared>,
    code: CodeSeq,
    source: CodeSource,
    closer_open: bool,
    done: Option<Box<dyn FnOnce() + Send>>,
) {
    let tx = shared.emit_tx.lock().unwrap();
    if let Some(tx) = tx.as_ref() {
        let _ = tx.send(EmitMsg::Code {
            code,
            source,
            closer_open,
            done,
        });
    }
}

fn emit_thread_run(shared: &Arc<Shared>, rx: mpsc::Receiver<EmitMsg>) {
    while let Ok(msg) = rx.recv() {
        let EmitMsg::Code {
            code,
            source,
            closer_open,
            done,
        } = msg
        else {
            break;
        };
        let mut callback_delay = 30;
        if !shared.internet_station_active.load(Ordering::SeqCst) {
            callback_delay = 1;
            if closer_open {
                let (station, remote) = {
                    let c = shared.cfg.lock().unwrap();
                    (c.station.clone(), c.remote)
                };
                update_sender(shared, &station);
                if let Some(r) = reader(shared) {
                    r.decode(&code);
                }
                record_code(shared, &code, source, "");
                if shared.connected.is_set() && remote {
                    if let Err(e) = wire(shared).write(&code) {
                        log::warn!("wire write failed: {e}");
                    }
                }
            }
            let local = shared.cfg.lock().unwrap().local;
            if local && source != CodeSource::Key {
                // The key's own physical/synth coupling already sounded it
                // at the moment of keying; everything else sounds here.
                // Sounding also spends the code's time when the closer is
                // shut, keeping the keyboard sender paced.
                kob(shared).sound_code(&code, source, closer_open);
            }
        }
        if let Some(done) = done {
            let delay = Duration::from_millis(callback_delay);
            thread::spawn(move || {
                thread::sleep(delay);
                done();
            });
        }
        if shared.shutdown.is_set() {
            break;
        }
    }
    log::debug!("emit thread done");
}

fn kb_thread_run(shared: &Arc<Shared>, rx: mpsc::Receiver<char>) {
    while let Ok(ch) = rx.recv() {
        if shared.shutdown.is_set() {
            break;
        }
        // Hold typed characters while a remote station is sending.
        while shared.internet_station_active.load(Ordering::SeqCst) {
            if shared.shutdown.wait(Duration::from_millis(100)) {
                return;
            }
        }
        let code = shared.msender.lock().unwrap().encode(ch);
        if code.is_empty() {
            continue;
        }
        match code.last() {
            Some(&LATCH) => {
                set_virtual_closer_closed(shared, true);
                continue;
            }
            Some(&UNLATCH) => {
                set_virtual_closer_closed(shared, false);
                continue;
            }
            _ => {}
        }
        if !kob(shared).virtual_closer_is_open() {
            continue; // circuit is closed; typed code is dropped
        }
        shared.kb_gate.clear();
        let gate = shared.kb_gate.clone();
        emit_code(
            shared,
            code,
            CodeSource::Keyboard,
            true,
            Some(Box::new(move || gate.set())),
        );
        shared.kb_gate.wait(Duration::from_secs(30));
    }
    log::debug!("keyboard thread done");
}

// ── Source handlers ──────────────────────────────────────────────────────────

/// Input from the external key (or keyer), on the key-read thread.
fn from_key(shared: &Arc<Shared>, code: Vec<i32>) {
    match code.last() {
        Some(&LATCH) => {
            set_virtual_closer_closed(shared, true);
            return;
        }
        Some(&UNLATCH) => {
            set_virtual_closer_closed(shared, false);
            return;
        }
        _ => {}
    }
    if !shared.internet_station_active.load(Ordering::SeqCst)
        && kob(shared).virtual_closer_is_open()
    {
        emit_code(shared, code, CodeSource::Key, true, None);
    }
}

/// Input from the wire, on the wire-read thread.
fn from_wire(shared: &Arc<Shared>, code: CodeSeq) {
    if shared.connected.is_set() {
        kob(shared).sound_code(&code, CodeSource::Wire, true);
        if let Some(r) = reader(shared) {
            r.decode(&code);
        }
        record_code(shared, &code, CodeSource::Wire, "");
        // A trailing latch means the remote circuit went back to closed.
        let remote_idle = code.last() == Some(&LATCH);
        shared
            .internet_station_active
            .store(!remote_idle, Ordering::SeqCst);
        kob(shared).set_internet_circuit_closed(remote_idle);
    } else {
        shared
            .internet_station_active
            .store(false, Ordering::SeqCst);
    }
}

/// Input from the player, on the playback thread.
fn from_player(shared: &Arc<Shared>, code: CodeSeq) {
    if shared.connected.is_set() {
        disconnect(shared);
    }
    kob(shared).sound_code(&code, CodeSource::Player, true);
    if let Some(r) = reader(shared) {
        r.decode(&code);
    }
}

// ── Closer semantics ─────────────────────────────────────────────────────────

/// Latch or unlatch the virtual closer. A repeated request in the same
/// direction is a no-op and emits nothing.
fn set_virtual_closer_closed(shared: &Arc<Shared>, closed: bool) {
    let kob_ = kob(shared);
    if kob_.virtual_closer_is_open() != closed {
        return; // already in the requested state
    }
    let code: &[i32] = if closed { &LATCH_CODE } else { &UNLATCH_CODE };
    kob_.set_virtual_closer_open(!closed);
    if !shared.internet_station_active.load(Ordering::SeqCst) {
        let (local, station) = {
            let c = shared.cfg.lock().unwrap();
            (c.local, c.station.clone())
        };
        if local {
            if !closed {
                update_sender(shared, &station);
            }
            kob_.energize_sounder(closed, CodeSource::Local, false);
            if let Some(r) = reader(shared) {
                r.decode(code);
            }
        }
        record_code(shared, code, CodeSource::Local, "");
    }
    let remote = shared.cfg.lock().unwrap().remote;
    if shared.connected.is_set() && remote {
        if let Err(e) = wire(shared).write(code) {
            log::warn!("wire write failed: {e}");
        }
    }
    if closed {
        if let Some(r) = reader(shared) {
            r.flush();
        }
    }
}

// ── Connection handling ──────────────────────────────────────────────────────

fn connect(shared: &Arc<Shared>) -> Result<()> {
    if shared.connected.is_set() {
        return Ok(());
    }
    *shared.sender_id.lock().unwrap() = String::new();
    let wire_no = shared.cfg.lock().unwrap().wire;
    wire(shared).connect(wire_no)?;
    shared.connected.set();
    kob(shared).set_wire_connected(true);
    Ok(())
}

fn disconnect(shared: &Arc<Shared>) {
    if !shared.connected.is_set() {
        return;
    }
    shared.connected.clear();
    wire(shared).disconnect();
    kob(shared).set_wire_connected(false);
    on_disconnect(shared);
}

/// Disconnect without the follow-up, for engine teardown.
fn disconnect_quietly(shared: &Arc<Shared>) {
    shared.connected.clear();
    wire(shared).disconnect();
}

fn on_disconnect(shared: &Arc<Shared>) {
    shared
        .internet_station_active
        .store(false, Ordering::SeqCst);
    *shared.sender_id.lock().unwrap() = String::new();
    if let Some(r) = reader(shared) {
        r.flush();
    }
    if !shared.odc_pending.swap(true, Ordering::SeqCst) {
        let weak = Arc::downgrade(shared);
        thread::Builder::new()
            .name("engine-disconnect-followup".into())
            .spawn(move || {
                let Some(s) = weak.upgrade() else { return };
                s.odc_pending.store(false, Ordering::SeqCst);
                if s.shutdown.wait(DISCONNECT_FOLLOWUP) {
                    return;
                }
                disconnect_followup(&s);
            })
            .ok();
    }
}

/// Runs shortly after a disconnect: latch the decoder closed, flush it, and
/// return the sounder to the idle closed-circuit position.
fn disconnect_followup(shared: &Arc<Shared>) {
    if let Some(r) = reader(shared) {
        r.decode_with(&LATCH_CODE, false);
        r.flush();
    }
    if let Some(cb) = &shared.callbacks.text {
        cb("\n#####\n");
    }
    let kob_ = kob(shared);
    if !kob_.virtual_closer_is_open() {
        kob_.energize_sounder(false, CodeSource::Local, false);
        kob_.energize_sounder(true, CodeSource::Local, true);
    }
}

// ── Morse parameter changes ──────────────────────────────────────────────────

fn set_morse(
    shared: &Arc<Shared>,
    code_type: CodeType,
    cwpm: u16,
    twpm: u16,
    spacing: Spacing,
) {
    let cwpm = cwpm.clamp(5, 45);
    let twpm = twpm.clamp(5, 45);
    let cwpm = cwpm.max(twpm); // char speed is at least the text speed
    {
        let mut cur = shared.morse_params.lock().unwrap();
        if *cur == (code_type, cwpm, twpm, spacing) {
            return;
        }
        *cur = (code_type, cwpm, twpm, spacing);
    }
    let decode_at_detected = {
        let mut cfg = shared.cfg.lock().unwrap();
        cfg.code_type = code_type;
        cfg.min_char_speed = cwpm;
        cfg.text_speed = twpm;
        cfg.spacing = spacing;
        cfg.decode_at_detected
    };
    *shared.msender.lock().unwrap() = Sender::new(twpm, cwpm, code_type, spacing);
    let new_reader = build_reader(shared, twpm, cwpm, code_type, decode_at_detected);
    *shared.mreader.lock().unwrap() = Some(new_reader);
    kob(shared).set_keyer_dit_len(1200 / cwpm.max(1) as i32);
    log::debug!("morse set: {code_type:?} {cwpm}/{twpm} {spacing:?}");
}
