//! Local terminal handling: raw mode and window size.

use crossterm::terminal;
use crossterm::tty::IsTty;
use warp_proto::WindowSize;

/// Puts the local terminal in raw mode for its lifetime; restores the
/// previous mode and emits a newline on drop so the shell prompt lands on a
/// clean line.
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new() -> std::io::Result<RawModeGuard> {
        terminal::enable_raw_mode()?;
        Ok(RawModeGuard(true))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = terminal::disable_raw_mode();
            println!();
        }
    }
}

pub fn window_size() -> std::io::Result<WindowSize> {
    let (cols, rows) = terminal::size()?;
    Ok(WindowSize { rows, cols })
}

pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_tty()
}
