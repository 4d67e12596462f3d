// src/main.rs - kobwire entry point: Morse receive & transmit terminal
//
// Connects to a wire and receives code from it, which is sounded and
// printed on the console. Follows the local key and opens the circuit when
// the key closer is opened, sending the local code to the wire. Typed
// characters go out through the keyboard sender; Esc toggles the virtual
// closer; Ctrl-C exits.
use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use kobwire::config::{Cli, Config};
use kobwire::engine::{Engine, EngineCallbacks};
use kobwire::kob::hardware;
use kobwire::recorder::PlaybackState;
use std::io::Write;
use std::time::Duration;

// Exit codes: 0 normal (including interrupt), 1 configuration or I/O error,
// 2 required hardware failed to initialize, 3 wire/protocol error.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_HARDWARE: i32 = 2;
const EXIT_PROTOCOL: i32 = 3;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kobwire: {e:#}");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

/// Raw-mode safe print: raw terminals need explicit carriage returns.
fn term_print(s: &str) {
    let mut out = std::io::stdout();
    let _ = out.write_all(s.replace('\n', "\r\n").as_bytes());
    let _ = out.flush();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    // ── --print-config / --write-config / --list-ports ────────────────────────
    if cli.print_config {
        print!("{}", kobwire::config::DEFAULT_CONFIG_JSON);
        return Ok(EXIT_OK);
    }
    if cli.write_config {
        let path = Config::write_default_config(&cli)?;
        println!("Config written to: {}", path.display());
        println!("Edit it to set your station, wire, speeds, etc.");
        return Ok(EXIT_OK);
    }
    if cli.list_ports {
        println!("Available serial ports:");
        for p in hardware::list_ports() {
            println!("  {p}");
        }
        return Ok(EXIT_OK);
    }

    // ── Load config ───────────────────────────────────────────────────────────
    let cfg = Config::load(&cli)?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.logging_level.clone()),
    )
    .init();

    println!("kobwire {}", env!("CARGO_PKG_VERSION"));
    if cli.play.is_none() {
        println!("Connecting to wire: {}", cfg.wire);
        println!("Connecting as station: {}", cfg.station);
    }
    if cfg.invert_key_input {
        println!(
            "IMPORTANT! Key input signal invert is enabled \
             (typically only used with a MODEM)."
        );
    }

    // ── Engine ────────────────────────────────────────────────────────────────
    let callbacks = EngineCallbacks {
        text: Some(Box::new(|txt| term_print(txt))),
        sender: Some(Box::new(|id| term_print(&format!("\n<<{id}>>\n")))),
        station: None,
        status: Some(Box::new(|msg| term_print(&format!("\n[{msg}]\n")))),
    };
    let require_hardware = cli.require_hardware;
    let wants_hardware = cfg.use_gpio || (cfg.use_serial && !cfg.serial_port.is_empty());
    let play = cli.play.clone();
    let max_silence = Duration::from_secs(cli.max_silence as u64);
    let speed_factor = cli.speed_factor;
    let list = cli.list;
    let record = cli.record.clone();
    let auto_connect = cfg.auto_connect;

    let engine = Engine::new(cfg, callbacks)?;
    if require_hardware && wants_hardware && !engine.hardware_available() {
        eprintln!("kobwire: hardware interface failed to initialize");
        return Ok(EXIT_HARDWARE);
    }
    engine.start();

    if let Some(name) = &record {
        let path = engine.record_start(Some(name));
        println!("Recording to: {}", path.display());
    }

    // ── Playback mode ─────────────────────────────────────────────────────────
    if let Some(path) = &play {
        let info = match engine.playback_start(path, max_silence, speed_factor) {
            Ok(info) => info,
            Err(e) => {
                eprintln!("kobwire: cannot play {}: {e}", path.display());
                return Ok(EXIT_CONFIG);
            }
        };
        println!(
            "[{}]  lines: {}  duration: {}s",
            path.display(),
            info.lines,
            (info.last_ts - info.first_ts).max(0) / 1000
        );
        if list {
            println!("Stations in recording:");
            for s in &info.stations {
                println!("  {s}");
            }
        }
        println!("Space pauses, Left/Right seek 15s, Up/Down seek sender, Ctrl-C quits.");
    } else if !auto_connect {
        // auto_connect already ran inside start()
        if let Err(e) = engine.connect() {
            eprintln!("kobwire: connect failed: {e}");
            engine.exit();
            return Ok(EXIT_PROTOCOL);
        }
    }

    // ── Keyboard loop ─────────────────────────────────────────────────────────
    terminal::enable_raw_mode()?;
    let exit_code = keyboard_loop(&engine, play.is_some());
    terminal::disable_raw_mode()?;

    println!();
    engine.exit();
    println!("73!");
    Ok(exit_code)
}

fn keyboard_loop(engine: &Engine, playing: bool) -> i32 {
    loop {
        // Playback runs to completion unless interrupted.
        if playing && engine.playback_state() == PlaybackState::Idle {
            return EXIT_OK;
        }
        match event::poll(Duration::from_millis(10)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(_) => return EXIT_CONFIG,
        }
        let Ok(Event::Key(k)) = event::read() else {
            continue;
        };
        if k.kind == KeyEventKind::Release {
            continue;
        }
        // Ctrl-C is the normal way out of an infinite loop program.
        if k.code == KeyCode::Char('c') && k.modifiers.contains(KeyModifiers::CONTROL) {
            return EXIT_OK;
        }
        if playing {
            match k.code {
                KeyCode::Char(' ') => engine.playback_pause_resume(),
                KeyCode::Left => engine.playback_move_seconds(-15),
                KeyCode::Right => engine.playback_move_seconds(15),
                KeyCode::Up => engine.playback_move_to_sender_begin(),
                KeyCode::Down => engine.playback_move_to_sender_end(),
                _ => {}
            }
            continue;
        }
        match k.code {
            KeyCode::Esc => {
                // Toggle the virtual closer (like flipping the key closer).
                engine.toggle_virtual_closer();
                let state = if engine.virtual_closer_is_open() {
                    "open"
                } else {
                    "closed"
                };
                term_print(&format!("\n[circuit {state}]\n"));
            }
            KeyCode::Enter => {
                term_print("\n");
                engine.send_text("\n");
            }
            KeyCode::Char(ch) => {
                // Echo locally so the sender can see what is queued.
                let ch = ch.to_ascii_uppercase();
                term_print(&ch.to_string());
                engine.send_text(&ch.to_string());
            }
            _ => {}
        }
    }
}
