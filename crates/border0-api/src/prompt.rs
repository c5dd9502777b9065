//! Terminal prompts for the legacy login flow.

use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::error::{ApiError, Result};

/// Restores cooked mode when dropped, even on early return.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// What a key press does to the line being edited.
#[derive(Debug, PartialEq, Eq)]
enum Edit {
    Push(char),
    Pop,
    Submit,
    Abort,
    Ignore,
}

fn classify(code: KeyCode, modifiers: KeyModifiers) -> Edit {
    match code {
        KeyCode::Char('c' | 'd') if modifiers.contains(KeyModifiers::CONTROL) => Edit::Abort,
        KeyCode::Char(c) => Edit::Push(c),
        KeyCode::Backspace => Edit::Pop,
        KeyCode::Enter => Edit::Submit,
        KeyCode::Esc => Edit::Abort,
        _ => Edit::Ignore,
    }
}

/// Read one line from the terminal, echoing it only if `echo` is set.
///
/// Blocks the calling thread; async callers run it on the blocking pool.
///
/// # Errors
///
/// Returns `ApiError::Io` if the terminal cannot be put into raw mode or
/// the user aborts with Ctrl-C, Ctrl-D or Esc.
pub fn read_line(label: &str, echo: bool) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}")?;
    stderr.flush()?;

    let mut line = String::new();
    {
        let _raw = RawModeGuard::enable()?;
        loop {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match classify(key.code, key.modifiers) {
                Edit::Push(c) => {
                    line.push(c);
                    if echo {
                        write!(stderr, "{c}")?;
                        stderr.flush()?;
                    }
                }
                Edit::Pop => {
                    if line.pop().is_some() && echo {
                        write!(stderr, "\u{8} \u{8}")?;
                        stderr.flush()?;
                    }
                }
                Edit::Submit => break,
                Edit::Abort => {
                    return Err(ApiError::Io(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "prompt aborted",
                    )));
                }
                Edit::Ignore => {}
            }
        }
    }
    writeln!(stderr)?;
    Ok(line.trim().to_string())
}

/// [`read_line`] on the blocking pool.
///
/// # Errors
///
/// See [`read_line`].
pub async fn read_line_async(label: &'static str, echo: bool) -> Result<String> {
    tokio::task::spawn_blocking(move || read_line(label, echo))
        .await
        .map_err(|e| ApiError::Io(io::Error::other(e)))?
}
