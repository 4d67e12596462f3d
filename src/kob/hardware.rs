// src/kob/hardware.rs - physical key/sounder transports
//
// Three transports: a memory-mapped GPIO pin pair (Raspberry Pi), a serial
// port's modem-status lines, and no hardware at all. The serial interface
// reads the key on DSR and the paddle-dah on CTS, drives the sounder with
// RTS, and powers a loop interface with DTR. A loopback-style adapter is
// detected by writing a probe string and reading it back; on those the key
// is on CTS and no paddle is available.
use std::io;

#[cfg(feature = "hw-serial")]
use std::io::{Read, Write};
#[cfg(feature = "hw-serial")]
use std::time::Duration;

/// Probe string for the loopback handshake.
#[cfg(feature = "hw-serial")]
const PROBE: &[u8] = b"kobwire\n";

/// USB serial-number substring identifying the dedicated key/sounder adapter.
#[cfg(feature = "hw-serial")]
const ADAPTER_SERIAL_TAG: &str = "KOB";

#[cfg(feature = "hw-gpio")]
const GPIO_KEY_PIN: u8 = 21; // key input, pulled up
#[cfg(feature = "hw-gpio")]
const GPIO_PDL_DAH_PIN: u8 = 20; // paddle-dah input, pulled up
#[cfg(feature = "hw-gpio")]
const GPIO_SOUNDER_PIN: u8 = 26; // sounder drive output

#[cfg(feature = "hw-serial")]
#[derive(Clone, Copy, PartialEq)]
pub enum SerialLine {
    Cts,
    Dsr,
    Nul,
}

/// The selected hardware transport. All reads return the raw electrical
/// sense; polarity inversion is applied by the caller.
pub enum Hw {
    None,
    #[cfg(feature = "hw-serial")]
    Serial {
        port: Box<dyn serialport::SerialPort>,
        key_line: SerialLine,
        dah_line: SerialLine,
        paddle_supported: bool,
    },
    #[cfg(feature = "hw-gpio")]
    Gpio {
        key: rppal::gpio::InputPin,
        dah: rppal::gpio::InputPin,
        sounder: rppal::gpio::OutputPin,
        paddle_supported: bool,
    },
}

impl Hw {
    pub fn is_available(&self) -> bool {
        !matches!(self, Hw::None)
    }

    pub fn paddle_supported(&self) -> bool {
        match self {
            Hw::None => false,
            #[cfg(feature = "hw-serial")]
            Hw::Serial {
                paddle_supported, ..
            } => *paddle_supported,
            #[cfg(feature = "hw-gpio")]
            Hw::Gpio {
                paddle_supported, ..
            } => *paddle_supported,
        }
    }

    /// True when the key contact is closed.
    pub fn read_key(&mut self) -> io::Result<bool> {
        match self {
            Hw::None => Ok(false),
            #[cfg(feature = "hw-serial")]
            Hw::Serial { port, key_line, .. } => read_line(port.as_mut(), *key_line),
            #[cfg(feature = "hw-gpio")]
            Hw::Gpio { key, .. } => Ok(key.is_low()), // pulled up: low = closed
        }
    }

    /// True when the paddle-dah contact is closed.
    pub fn read_paddle_dah(&mut self) -> io::Result<bool> {
        match self {
            Hw::None => Ok(false),
            #[cfg(feature = "hw-serial")]
            Hw::Serial { port, dah_line, .. } => read_line(port.as_mut(), *dah_line),
            #[cfg(feature = "hw-gpio")]
            Hw::Gpio { dah, .. } => Ok(dah.is_low()),
        }
    }

    /// Energize or release the physical sounder.
    pub fn set_sounder(&mut self, energize: bool) -> io::Result<()> {
        match self {
            Hw::None => Ok(()),
            #[cfg(feature = "hw-serial")]
            Hw::Serial { port, .. } => port
                .write_request_to_send(energize)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            #[cfg(feature = "hw-gpio")]
            Hw::Gpio { sounder, .. } => {
                if energize {
                    sounder.set_high();
                } else {
                    sounder.set_low();
                }
                Ok(())
            }
        }
    }
}

#[cfg(feature = "hw-serial")]
fn read_line(port: &mut dyn serialport::SerialPort, line: SerialLine) -> io::Result<bool> {
    let v = match line {
        SerialLine::Cts => port.read_clear_to_send(),
        SerialLine::Dsr => port.read_data_set_ready(),
        SerialLine::Nul => return Ok(false),
    };
    v.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Open the configured transport. GPIO takes priority when both are
/// requested. Failure leaves the engine running with hardware disabled; the
/// reason is reported through `err_msg`.
pub fn open(
    use_gpio: bool,
    serial_port: Option<&str>,
    err_msg: &dyn Fn(&str),
) -> Hw {
    if use_gpio {
        #[cfg(feature = "hw-gpio")]
        {
            match open_gpio() {
                Ok(hw) => {
                    log::info!("GPIO interface is available and will be used");
                    return hw;
                }
                Err(e) => {
                    err_msg(&format!(
                        "Interface for key/sounder on GPIO not available: {e}. \
                         GPIO key/sounder will not function."
                    ));
                }
            }
        }
        #[cfg(not(feature = "hw-gpio"))]
        err_msg("GPIO support is not compiled in. GPIO key/sounder will not function.");
    }
    if let Some(port_name) = serial_port {
        if !port_name.is_empty() {
            #[cfg(feature = "hw-serial")]
            {
                match open_serial(port_name) {
                    Ok(hw) => {
                        log::info!("serial interface on {port_name} is available and will be used");
                        return hw;
                    }
                    Err(e) => {
                        err_msg(&format!(
                            "Serial port '{port_name}' is not available: {e}. \
                             Key/sounder will not function."
                        ));
                    }
                }
            }
            #[cfg(not(feature = "hw-serial"))]
            err_msg("Serial support is not compiled in. Key/sounder will not function.");
        }
    }
    Hw::None
}

#[cfg(feature = "hw-gpio")]
fn open_gpio() -> io::Result<Hw> {
    use rppal::gpio::Gpio;
    let gpio = Gpio::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let key = gpio
        .get(GPIO_KEY_PIN)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .into_input_pullup();
    let dah = gpio
        .get(GPIO_PDL_DAH_PIN)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .into_input_pullup();
    let sounder = gpio
        .get(GPIO_SOUNDER_PIN)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .into_output_low();
    Ok(Hw::Gpio {
        key,
        dah,
        sounder,
        paddle_supported: true,
    })
}

#[cfg(feature = "hw-serial")]
fn open_serial(port_name: &str) -> io::Result<Hw> {
    let mut port = serialport::new(port_name, 9600)
        .timeout(Duration::from_millis(500))
        .open()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    // DTR powers the loop interface.
    port.write_data_terminal_ready(true)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    // Prime the modem-status lines.
    let _ = port.read_clear_to_send();
    let _ = port.read_data_set_ready();
    // Loopback handshake: an adapter that echoes the probe keeps the key on
    // CTS and has no paddle input.
    let echoed = probe_loopback(port.as_mut());
    let (key_line, dah_line, paddle_supported) = if echoed {
        log::info!("serial interface is 'minimal' type (key on CTS)");
        (SerialLine::Cts, SerialLine::Nul, false)
    } else {
        log::info!("serial interface is 'full' type (key/pdl-dit on DSR, pdl-dah on CTS)");
        (SerialLine::Dsr, SerialLine::Cts, true)
    };
    Ok(Hw::Serial {
        port,
        key_line,
        dah_line,
        paddle_supported,
    })
}

#[cfg(feature = "hw-serial")]
fn probe_loopback(port: &mut dyn serialport::SerialPort) -> bool {
    if port.write_all(PROBE).is_err() {
        return false;
    }
    std::thread::sleep(Duration::from_millis(500));
    let mut buf = [0u8; 16];
    match port.read(&mut buf) {
        Ok(n) if n >= PROBE.len() => &buf[..PROBE.len()] == PROBE,
        _ => false,
    }
}

/// List candidate serial ports, flagging the dedicated adapter when its USB
/// serial number carries the known tag.
pub fn list_ports() -> Vec<String> {
    let mut out: Vec<String> = vec![];
    #[cfg(feature = "hw-serial")]
    if let Ok(ports) = serialport::available_ports() {
        for p in ports {
            let tag = match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let sn = usb.serial_number.as_deref().unwrap_or("");
                    if sn.contains(ADAPTER_SERIAL_TAG) {
                        "  [key/sounder adapter]"
                    } else {
                        ""
                    }
                }
                _ => "",
            };
            out.push(format!("{}{}", p.port_name, tag));
        }
    }
    if out.is_empty() {
        #[cfg(feature = "hw-serial")]
        out.push("No serial ports found.".into());
        #[cfg(not(feature = "hw-serial"))]
        out.push("Serial support is not compiled in.".into());
    }
    out
}

/// Find a port whose USB serial number identifies the dedicated adapter.
pub fn find_adapter_port() -> Option<String> {
    #[cfg(feature = "hw-serial")]
    {
        if let Ok(ports) = serialport::available_ports() {
            for p in ports {
                if let serialport::SerialPortType::UsbPort(usb) = &p.port_type {
                    if usb
                        .serial_number
                        .as_deref()
                        .is_some_and(|sn| sn.contains(ADAPTER_SERIAL_TAG))
                    {
                        return Some(p.port_name);
                    }
                }
            }
        }
    }
    None
}
