// src/recorder.rs - code stream recorder and indexed player
//
// Records wire and local station code for analysis and playback, one JSON
// object per line: ts (ms timestamp), w (wire), s (station), o (source tag),
// t (decoded text, optional), c (code elements). On playback the file is
// scanned once into an in-memory index of (timestamp, offset, sender-change)
// entries so seeks and sender navigation stay cheap.
use crate::morse::{CodeSeq, CodeSource, DISCONTINUITY, UNLATCH};
use crate::sync::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const RECORDING_EXT: &str = ".pkrec";
/// Deprecated recording extension, still accepted on read.
pub const RECORDING_EXT_DEP: &str = ".json";

/// Long recorded pauses are trimmed to this and the remainder slept here,
/// where clamping to max-silence is possible.
const PAUSE_HANDOFF_MS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    ts: i64,
    w: i32,
    s: String,
    o: u8,
    #[serde(default)]
    t: String,
    c: Vec<i32>,
}

/// Millisecond wall-clock timestamp.
pub fn get_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Append the recording extension if the name doesn't already carry one.
pub fn add_ext_if_needed(name: &str) -> String {
    if name.ends_with(RECORDING_EXT) || name.ends_with(RECORDING_EXT_DEP) {
        name.to_string()
    } else {
        format!("{name}{RECORDING_EXT}")
    }
}

/// `Session-YYYYMMDD-HHMM.pkrec` style name from the current time.
pub fn generate_session_recording_name() -> String {
    let secs = get_timestamp() / 1000;
    let days = secs / 86400;
    let (y, m, d) = civil_from_days(days);
    let tod = secs % 86400;
    format!(
        "Session-{:04}{:02}{:02}-{:02}{:02}{}",
        y,
        m,
        d,
        tod / 3600,
        (tod % 3600) / 60,
        RECORDING_EXT
    )
}

// Days-since-epoch to (year, month, day), civil calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

struct IndexEntry {
    ts: i64,
    pos: u64,
    sender_change: bool,
}

struct PlayerState {
    file: Option<BufReader<File>>,
    line_no: usize,
    index: Vec<IndexEntry>,
    /// Timestamp of the previously played record; the baseline for pacing.
    last_ts: i64,
}

pub struct PlaybackInfo {
    pub lines: usize,
    pub first_ts: i64,
    pub last_ts: i64,
    pub stations: Vec<String>,
}

pub type PlayCodeCallback = Box<dyn Fn(CodeSeq) + Send + Sync>;
pub type PlaySenderCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type PlayWireCallback = Box<dyn Fn(i32) + Send + Sync>;
pub type PlayFinishedCallback = Box<dyn Fn() + Send + Sync>;

pub struct PlayerCallbacks {
    pub code: Option<PlayCodeCallback>,
    pub sender: Option<PlaySenderCallback>,
    pub wire: Option<PlayWireCallback>,
    pub finished: Option<PlayFinishedCallback>,
}

/// Recorder and player of code streams. Recording is suppressed while a
/// playback from the same instance is running.
pub struct Recorder {
    target_path: Mutex<Option<PathBuf>>,
    source_path: Mutex<Option<PathBuf>>,
    station_id: Mutex<String>,
    wire: Mutex<i32>,
    state: Mutex<PlaybackState>,
    player: Mutex<PlayerState>,
    player_station: Mutex<Option<String>>,
    callbacks: PlayerCallbacks,
    resume: Event,
    stop: Event,
    shutdown: Event,
    playback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(
        target_path: Option<&Path>,
        source_path: Option<&Path>,
        station_id: &str,
        wire: i32,
        callbacks: PlayerCallbacks,
    ) -> Self {
        Self {
            target_path: Mutex::new(target_path.map(PathBuf::from)),
            source_path: Mutex::new(source_path.map(PathBuf::from)),
            station_id: Mutex::new(station_id.to_string()),
            wire: Mutex::new(wire),
            state: Mutex::new(PlaybackState::Idle),
            player: Mutex::new(PlayerState {
                file: None,
                line_no: 0,
                index: Vec::new(),
                last_ts: -1,
            }),
            player_station: Mutex::new(None),
            callbacks,
            resume: Event::new(),
            stop: Event::new(),
            shutdown: Event::new(),
            playback_thread: Mutex::new(None),
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    pub fn set_station_id(&self, id: &str) {
        *self.station_id.lock().unwrap() = id.to_string();
    }

    pub fn set_wire(&self, wire: i32) {
        *self.wire.lock().unwrap() = wire;
    }

    pub fn set_source_path(&self, path: &Path) {
        *self.source_path.lock().unwrap() = Some(path.to_path_buf());
    }

    pub fn target_path(&self) -> Option<PathBuf> {
        self.target_path.lock().unwrap().clone()
    }

    // ── Write path ───────────────────────────────────────────────────────────

    /// Append one record. No-op during playback or without a target file.
    pub fn record(&self, code: &[i32], source: CodeSource, text: &str) {
        if *self.state.lock().unwrap() != PlaybackState::Idle {
            return;
        }
        let target = self.target_path.lock().unwrap().clone();
        let Some(target) = target else { return };
        let record = Record {
            ts: get_timestamp(),
            w: *self.wire.lock().unwrap(),
            s: self.station_id.lock().unwrap().clone(),
            o: source.as_tag(),
            t: text.to_string(),
            c: code.to_vec(),
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .and_then(|mut f| {
                let line = serde_json::to_string(&record)?;
                writeln!(f, "{line}")
            });
        if let Err(e) = result {
            log::error!("recording to {} failed: {e}", target.display());
        }
    }

    // ── Read path ────────────────────────────────────────────────────────────

    /// Scan the source file, build the index, and start the playback thread.
    /// Returns the recording's line count, time span and station set.
    /// Associated function because the playback thread keeps the recorder
    /// alive through its own handle.
    pub fn playback_start(
        this: &Arc<Recorder>,
        max_silence: Duration,
        speed_factor: u32,
    ) -> std::io::Result<PlaybackInfo> {
        this.playback_stop();
        this.resume.clear();
        this.stop.clear();

        let source = this
            .source_path
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no source file"))?;
        let mut file = BufReader::new(File::open(&source)?);
        let mut index = vec![IndexEntry {
            ts: 0,
            pos: 0,
            sender_change: false,
        }];
        let mut stations = BTreeSet::new();
        let mut first_ts = -1i64;
        let mut last_ts = 0i64;
        let mut lines = 0usize;
        let mut previous_station: Option<String> = None;
        let mut pos = 0u64;
        let mut line = String::new();
        loop {
            line.clear();
            let n = file.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            pos += n as u64;
            let record: Record = match serde_json::from_str(line.trim_end()) {
                Ok(r) => r,
                Err(e) => {
                    // A bad line is logged and skipped; playback continues.
                    log::error!("{}:{}: bad record: {e}", source.display(), lines + 1);
                    continue;
                }
            };
            index.push(IndexEntry {
                ts: record.ts,
                pos,
                sender_change: previous_station.as_deref() != Some(record.s.as_str()),
            });
            previous_station = Some(record.s.clone());
            if first_ts == -1 || record.ts < first_ts {
                first_ts = record.ts;
            }
            if record.ts > last_ts {
                last_ts = record.ts;
            }
            lines += 1;
            stations.insert(record.s);
        }

        {
            let mut p = this.player.lock().unwrap();
            let mut f = BufReader::new(File::open(&source)?);
            f.seek(SeekFrom::Start(0))?;
            p.file = Some(f);
            p.line_no = 0;
            p.index = index;
            p.last_ts = -1;
        }
        *this.player_station.lock().unwrap() = None;
        *this.state.lock().unwrap() = PlaybackState::Playing;

        let player = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("recorder-playback".into())
            .spawn(move || playback_body(&player, max_silence, speed_factor))?;
        *this.playback_thread.lock().unwrap() = Some(handle);

        Ok(PlaybackInfo {
            lines,
            first_ts,
            last_ts,
            stations: stations.into_iter().collect(),
        })
    }

    pub fn playback_stop(&self) {
        self.stop.set();
        self.resume.set(); // wake a paused player so it can observe the stop
        if let Some(t) = self.playback_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        *self.state.lock().unwrap() = PlaybackState::Idle;
    }

    pub fn playback_pause(&self) {
        let mut st = self.state.lock().unwrap();
        if *st == PlaybackState::Playing {
            self.resume.clear();
            *st = PlaybackState::Paused;
        }
    }

    pub fn playback_resume(&self) {
        let mut st = self.state.lock().unwrap();
        if *st == PlaybackState::Paused {
            *st = PlaybackState::Playing;
            self.resume.set();
        }
    }

    pub fn playback_pause_resume(&self) {
        let st = *self.state.lock().unwrap();
        match st {
            PlaybackState::Playing => self.playback_pause(),
            PlaybackState::Paused => self.playback_resume(),
            PlaybackState::Idle => {}
        }
    }

    /// Move the playback position forward or backward by whole seconds.
    pub fn playback_move_seconds(&self, seconds: i64) {
        if seconds == 0 {
            return;
        }
        let mut p = self.player.lock().unwrap();
        if p.file.is_none() {
            return;
        }
        let current = p.line_no;
        let len = p.index.len();
        if current == 0 || current >= len - 1 {
            return;
        }
        let current_ts = p.index[current].ts;
        let target_ts = current_ts + seconds * 1000;
        let found = if seconds > 0 {
            (current..len - 1).find(|&i| p.index[i].ts >= target_ts)
        } else {
            (1..=current).rev().find(|&i| p.index[i].ts <= target_ts)
        };
        if let Some(i) = found {
            seek_to(&mut p, i);
        }
    }

    /// Move back to the start of the current sender.
    pub fn playback_move_to_sender_begin(&self) {
        let mut p = self.player.lock().unwrap();
        if p.file.is_none() {
            return;
        }
        let current = p.line_no;
        if current == 0 || current >= p.index.len() - 1 {
            return;
        }
        for i in (1..=current).rev() {
            if p.index[i].sender_change {
                let i = if i > 0 { i - 1 } else { i };
                seek_to(&mut p, i);
                break;
            }
        }
    }

    /// Move forward to the end of the current sender.
    pub fn playback_move_to_sender_end(&self) {
        let mut p = self.player.lock().unwrap();
        if p.file.is_none() {
            return;
        }
        let current = p.line_no;
        let len = p.index.len();
        if current == 0 || current >= len - 1 {
            return;
        }
        for i in current..len - 1 {
            if p.index[i].sender_change {
                let i = if i > 0 { i - 1 } else { i };
                seek_to(&mut p, i);
                break;
            }
        }
    }

    /// Initiate shutdown of operations without blocking.
    pub fn shutdown(&self) {
        self.shutdown.set();
        self.stop.set();
        self.resume.set();
    }

    pub fn exit(&self) {
        self.shutdown();
        self.playback_stop();
    }

}

fn playback_body(this: &Recorder, max_silence: Duration, speed_factor: u32) {
    loop {
        if this.stop.is_set() || this.shutdown.is_set() {
            break;
        }
        // Paused: wait for resume, which stop also sets.
        while *this.state.lock().unwrap() == PlaybackState::Paused {
            this.resume.wait(Duration::from_millis(250));
            if this.stop.is_set() || this.shutdown.is_set() {
                break;
            }
        }
        let parsed = {
            let mut p = this.player.lock().unwrap();
            let Some(file) = p.file.as_mut() else { break };
            let mut line = String::new();
            match file.read_line(&mut line) {
                Ok(0) => break, // end of recording
                Ok(_) => {
                    p.line_no += 1;
                    let record: Option<Record> = serde_json::from_str::<Record>(line.trim_end())
                        .ok()
                        .or_else(|| {
                            log::error!("bad record at line {}; skipping", p.line_no);
                            None
                        });
                    record.map(|r| {
                        let last = p.last_ts;
                        p.last_ts = r.ts;
                        (r, last)
                    })
                }
                Err(e) => {
                    log::error!("playback read failed: {e}");
                    break;
                }
            }
        };
        let Some((mut record, prev_ts)) = parsed else {
            continue;
        };
        let prev_ts = if prev_ts < 0 { record.ts } else { prev_ts };
        if record.c.is_empty() {
            continue;
        }
        // Long pauses and sender changes are handled here from the
        // recorded timestamps; short ones ride in the code itself.
        let code_pause_ms = -(record.c[0] as i64);
        let mut pause = Duration::ZERO;
        let sender_changed =
            this.player_station.lock().unwrap().as_deref() != Some(record.s.as_str());
        if record.c[0] == DISCONTINUITY && record.c.len() > 1 && record.c[1] == UNLATCH {
            if sender_changed {
                // honor the recorded pause between senders
                pause = Duration::from_millis((record.ts - prev_ts).max(0) as u64);
            }
        } else if code_pause_ms > PAUSE_HANDOFF_MS && record.c[0] != DISCONTINUITY {
            let total = (record.ts - prev_ts).max(0);
            pause = Duration::from_millis((total - PAUSE_HANDOFF_MS).max(0) as u64);
            record.c[0] = -(PAUSE_HANDOFF_MS as i32);
        }
        if !pause.is_zero() {
            if !max_silence.is_zero() && pause > max_silence {
                pause = max_silence;
            }
            if this.stop.wait(pause) {
                break;
            }
        }
        if speed_factor != 100 && speed_factor != 0 {
            let sf = 100.0 / speed_factor as f64;
            for c in record.c.iter_mut() {
                if (*c < 0 || *c > UNLATCH) && *c != DISCONTINUITY {
                    *c = (sf * *c as f64).round() as i32;
                }
            }
        }
        *this.wire.lock().unwrap() = record.w;
        if let Some(cb) = &this.callbacks.wire {
            cb(record.w);
        }
        let changed = {
            let mut ps = this.player_station.lock().unwrap();
            let changed = ps.as_deref() != Some(record.s.as_str());
            *ps = Some(record.s.clone());
            changed
        };
        if changed {
            if let Some(cb) = &this.callbacks.sender {
                cb(&record.s);
            }
        }
        if let Some(cb) = &this.callbacks.code {
            cb(record.c);
        }
    }
    *this.state.lock().unwrap() = PlaybackState::Idle;
    {
        let mut p = this.player.lock().unwrap();
        p.file = None;
    }
    if let Some(cb) = &this.callbacks.finished {
        cb();
    }
    log::debug!("playback thread done");
}

/// Reposition the file and reset the pacing baseline so there is no
/// spurious catch-up sleep after a seek.
fn seek_to(p: &mut PlayerState, i: usize) {
    let ts = p.index[i].ts;
    let pos = p.index[i].pos;
    if let Some(f) = p.file.as_mut() {
        if f.seek(SeekFrom::Start(pos)).is_ok() {
            log::debug!("seek to line {i} pos {pos} ts {ts}");
            p.line_no = i;
            p.last_ts = ts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn temp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("kobwire-test-{}-{}", std::process::id(), name));
        p
    }

    fn no_callbacks() -> PlayerCallbacks {
        PlayerCallbacks {
            code: None,
            sender: None,
            wire: None,
            finished: None,
        }
    }

    #[test]
    fn record_appends_json_lines() {
        let path = temp_file("rec.pkrec");
        let _ = std::fs::remove_file(&path);
        let rec = Recorder::new(Some(path.as_path()), None, "KOB TEST", 101, no_callbacks());
        rec.record(&[-230, 60, -60, 180], CodeSource::Local, "");
        rec.record(&[], CodeSource::Local, "A");
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let r: Record = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(r.w, 101);
        assert_eq!(r.s, "KOB TEST");
        assert_eq!(r.o, CodeSource::Local.as_tag());
        assert_eq!(r.c, vec![-230, 60, -60, 180]);
        let r: Record = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(r.t, "A");
        let _ = std::fs::remove_file(&path);
    }

    fn write_recording(path: &Path, records: &[(i64, &str, &[i32])]) {
        let mut out = String::new();
        for (ts, s, c) in records {
            let r = Record {
                ts: *ts,
                w: 5,
                s: s.to_string(),
                o: CodeSource::Wire.as_tag(),
                t: String::new(),
                c: c.to_vec(),
            };
            out.push_str(&serde_json::to_string(&r).unwrap());
            out.push('\n');
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn playback_delivers_in_order_with_sender_notifications() {
        let path = temp_file("play.pkrec");
        write_recording(
            &path,
            &[
                (1000, "ALPHA", &[-100, 60]),
                (1200, "ALPHA", &[-60, 60]),
                (1400, "BRAVO", &[DISCONTINUITY, UNLATCH]),
                (1500, "BRAVO", &[-60, 180]),
            ],
        );
        let (code_tx, code_rx) = mpsc::channel();
        let (sender_tx, sender_rx) = mpsc::channel::<String>();
        let rec = Arc::new(Recorder::new(
            None,
            Some(path.as_path()),
            "",
            0,
            PlayerCallbacks {
                code: Some(Box::new(move |c| {
                    let _ = code_tx.send(c);
                })),
                sender: Some(Box::new(move |s| {
                    let _ = sender_tx.send(s.to_string());
                })),
                wire: None,
                finished: None,
            },
        ));
        let info = Recorder::playback_start(&rec, Duration::from_secs(1), 100).unwrap();
        assert_eq!(info.lines, 4);
        assert_eq!(info.first_ts, 1000);
        assert_eq!(info.last_ts, 1500);
        assert_eq!(info.stations, vec!["ALPHA".to_string(), "BRAVO".to_string()]);

        // Sender boundary precedes the first code of the new sender.
        assert_eq!(
            sender_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "ALPHA"
        );
        assert_eq!(
            code_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![-100, 60]
        );
        assert_eq!(
            code_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![-60, 60]
        );
        assert_eq!(
            sender_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "BRAVO"
        );
        assert_eq!(
            code_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![DISCONTINUITY, UNLATCH]
        );
        rec.playback_stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn speed_factor_scales_non_sentinel_elements() {
        let path = temp_file("speed.pkrec");
        write_recording(&path, &[(1000, "A", &[DISCONTINUITY, -120, 60, 2])]);
        let (code_tx, code_rx) = mpsc::channel();
        let rec = Arc::new(Recorder::new(
            None,
            Some(path.as_path()),
            "",
            0,
            PlayerCallbacks {
                code: Some(Box::new(move |c| {
                    let _ = code_tx.send(c);
                })),
                sender: None,
                wire: None,
                finished: None,
            },
        ));
        Recorder::playback_start(&rec, Duration::ZERO, 200).unwrap();
        let code = code_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // 200% speed halves durations; sentinels pass through untouched.
        assert_eq!(code, vec![DISCONTINUITY, -60, 30, 2]);
        rec.playback_stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let path = temp_file("bad.pkrec");
        let good = serde_json::to_string(&Record {
            ts: 1000,
            w: 1,
            s: "A".into(),
            o: 1,
            t: String::new(),
            c: vec![-100, 60],
        })
        .unwrap();
        std::fs::write(&path, format!("{good}\nnot json at all\n{good}\n")).unwrap();
        let (code_tx, code_rx) = mpsc::channel();
        let rec = Arc::new(Recorder::new(
            None,
            Some(path.as_path()),
            "",
            0,
            PlayerCallbacks {
                code: Some(Box::new(move |c| {
                    let _ = code_tx.send(c);
                })),
                sender: None,
                wire: None,
                finished: None,
            },
        ));
        let info = Recorder::playback_start(&rec, Duration::ZERO, 100).unwrap();
        assert_eq!(info.lines, 2);
        assert!(code_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(code_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        rec.playback_stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recording_is_suppressed_during_playback() {
        let source = temp_file("suppress-src.pkrec");
        // A long recorded pause keeps the player busy while we try to record.
        write_recording(
            &source,
            &[(1000, "A", &[-100, 60]), (20_000, "A", &[-8000, 60])],
        );
        let target = temp_file("suppress-dst.pkrec");
        let _ = std::fs::remove_file(&target);
        let rec = Arc::new(Recorder::new(
            Some(target.as_path()),
            Some(source.as_path()),
            "ME",
            1,
            no_callbacks(),
        ));
        Recorder::playback_start(&rec, Duration::from_secs(5), 100).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        rec.record(&[-60, 60], CodeSource::Local, "");
        rec.playback_stop();
        assert!(!target.exists());
        rec.record(&[-60, 60], CodeSource::Local, "");
        assert!(target.exists());
        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn seek_moves_by_index() {
        let path = temp_file("seek.pkrec");
        let records: Vec<(i64, String, Vec<i32>)> = (0..20)
            .map(|i| (1000 + i * 1000, "A".to_string(), vec![-100, 60]))
            .collect();
        let refs: Vec<(i64, &str, &[i32])> = records
            .iter()
            .map(|(ts, s, c)| (*ts, s.as_str(), c.as_slice()))
            .collect();
        write_recording(&path, &refs);
        let rec = Arc::new(Recorder::new(None, Some(path.as_path()), "", 0, no_callbacks()));
        Recorder::playback_start(&rec, Duration::ZERO, 100).unwrap();
        rec.playback_pause();
        {
            // Pretend playback is at line 5, then seek forward 10 seconds.
            let mut p = rec.player.lock().unwrap();
            p.line_no = 5;
        }
        rec.playback_move_seconds(10);
        {
            let p = rec.player.lock().unwrap();
            let target = 1000 + 4 * 1000 + 10_000;
            assert!(p.index[p.line_no].ts >= target);
            assert_eq!(p.last_ts, p.index[p.line_no].ts);
        }
        rec.playback_move_seconds(-10);
        {
            let p = rec.player.lock().unwrap();
            assert!(p.line_no >= 1);
        }
        rec.playback_stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sender_boundary_navigation() {
        let path = temp_file("boundary.pkrec");
        write_recording(
            &path,
            &[
                (1000, "A", &[-1, 60]),
                (2000, "A", &[-1, 60]),
                (3000, "B", &[-1, 60]),
                (4000, "B", &[-1, 60]),
                (5000, "C", &[-1, 60]),
            ],
        );
        let rec = Arc::new(Recorder::new(None, Some(path.as_path()), "", 0, no_callbacks()));
        Recorder::playback_start(&rec, Duration::ZERO, 100).unwrap();
        rec.playback_pause();
        {
            let mut p = rec.player.lock().unwrap();
            p.line_no = 4; // inside sender B
        }
        rec.playback_move_to_sender_begin();
        {
            let p = rec.player.lock().unwrap();
            // Lands just before the B boundary (index entry 3 is the change).
            assert!(p.line_no <= 3);
        }
        rec.playback_stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn extension_helpers() {
        assert_eq!(add_ext_if_needed("abc"), "abc.pkrec");
        assert_eq!(add_ext_if_needed("abc.pkrec"), "abc.pkrec");
        assert_eq!(add_ext_if_needed("abc.json"), "abc.json");
        assert!(generate_session_recording_name().starts_with("Session-"));
    }
}
