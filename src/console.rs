//! Console interaction: passphrase prompts, virtual console setup and the
//! emergency shell.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{info, warn};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use tokio::sync::Mutex;
use zeroize::Zeroize;

use crate::types::Passphrase;

const CONSOLE_PATH: &str = "/dev/console";
const VCONSOLE_CONF: &str = "/etc/vconsole.conf";

lazy_static! {
    // one prompt at a time, or concurrent unlocks garble each other's input
    static ref CONSOLE: Mutex<()> = Mutex::new(());
}

/// Prompt on the console and read one line with echo disabled.
pub async fn read_passphrase(prompt: &str) -> Result<Passphrase> {
    let _guard = CONSOLE.lock().await;
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || read_passphrase_blocking(&prompt))
        .await
        .context("console task failed")?
}

fn read_passphrase_blocking(prompt: &str) -> Result<Passphrase> {
    let mut console = OpenOptions::new()
        .read(true)
        .write(true)
        .open(CONSOLE_PATH)
        .with_context(|| format!("unable to open {}", CONSOLE_PATH))?;

    console
        .write_all(prompt.as_bytes())
        .and_then(|_| console.flush())
        .context("unable to write prompt")?;

    let saved = tcgetattr(&console).context("unable to read console termios")?;
    let mut silent = saved.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(&console, SetArg::TCSANOW, &silent).context("unable to disable echo")?;

    let result = read_line(&mut console);

    // restore echo whatever happened, and move past the unechoed newline
    let _ = tcsetattr(&console, SetArg::TCSANOW, &saved);
    let _ = console.write_all(b"\n");

    result
}

fn read_line(console: &mut File) -> Result<Passphrase> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = console.read(&mut byte).context("unable to read console")?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    let passphrase = Passphrase::from(line.clone());
    line.zeroize();
    Ok(passphrase)
}

/// Apply the console font and keymap packaged in the image. Best effort:
/// a boot does not fail over cosmetics.
pub async fn setup_virtual_console() -> Result<()> {
    let conf = match std::fs::read_to_string(VCONSOLE_CONF) {
        Ok(conf) => conf,
        Err(_) => return Ok(()),
    };

    let mut font = None;
    let mut keymap = None;
    for line in conf.lines() {
        match line.split_once('=') {
            Some(("FONT", value)) => font = Some(value.trim_matches('"').to_string()),
            Some(("KEYMAP", value)) => keymap = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }

    if let Some(font) = font {
        info!("loading console font {}", font);
        match tokio::process::Command::new("setfont")
            .arg(&font)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("setfont exited with {}", status),
            Err(e) => warn!("unable to run setfont: {}", e),
        }
    }
    if let Some(keymap) = keymap {
        info!("loading keymap {}", keymap);
        match tokio::process::Command::new("loadkeys")
            .arg(&keymap)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("loadkeys exited with {}", status),
            Err(e) => warn!("unable to run loadkeys: {}", e),
        }
    }
    Ok(())
}

/// Last resort on a fatal error: hand the console to a shell if the image
/// packs one. Exiting PID 1 panics the kernel, which is the only other
/// option left.
pub fn emergency_shell() -> ! {
    for shell in ["/bin/sh", "/usr/bin/sh", "/bin/busybox"] {
        if !std::path::Path::new(shell).exists() {
            continue;
        }
        warn!("starting emergency shell {}", shell);
        let shell_c = CString::new(shell).unwrap();
        let _ = nix::unistd::execv(&shell_c, &[shell_c.as_c_str()]);
    }
    std::process::exit(1);
}
