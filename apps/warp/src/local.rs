//! In-warp command client: dials the host's local command socket from inside
//! the shared shell and renders the reply.

use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio::net::UnixStream;
use warp_proto::{
    command, read_record, write_record, Command, CommandResult, Mode, ENV_WARP,
    ENV_WARP_UNIX_SOCKET,
};

use crate::srv::socket_path;

/// Presence of `WARP_UNIX_SOCKET` is how in-warp commands detect they run
/// inside a warp.
pub fn check_in_warp() -> anyhow::Result<()> {
    let in_warp = std::env::var(ENV_WARP_UNIX_SOCKET)
        .map(|value| !value.is_empty())
        .unwrap_or(false);
    if in_warp {
        return Ok(());
    }
    println!();
    println!("`warp` uses the environment variables `{ENV_WARP}` and `{ENV_WARP_UNIX_SOCKET}` to");
    println!("detect that it is running from inside a warp (for in-warp commands). They are");
    println!("not currently set, indicating that you are not executing this from inside a");
    println!("warp.");
    println!();
    println!("Expert mode: if you attached a pre-existing tmux or screen session from your");
    println!("current warp, these variables will not be propagated automatically. You can fix");
    println!("this by setting them manually in your current environment.");
    println!();
    bail!("This command is only available from inside a warp.");
}

fn command_socket() -> PathBuf {
    match std::env::var(ENV_WARP_UNIX_SOCKET) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => {
            let warp = std::env::var(ENV_WARP).unwrap_or_default();
            socket_path(&warp)
        }
    }
}

/// Send one command and wait for its single reply. Errors carried in the
/// reply are turned into human-readable failures.
pub async fn run_command(cmd: Command) -> anyhow::Result<CommandResult> {
    check_in_warp()?;
    let path = command_socket();
    let mut stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("Failed to connect to {}", path.display()))?;
    write_record(&mut stream, &cmd)
        .await
        .context("Failed to send command")?;
    let result: CommandResult = read_record(&mut stream)
        .await
        .context("Failed to receive command result")?;
    if let Some(err) = &result.error {
        bail!("Received {}: {}", err.code, err.message);
    }
    Ok(result)
}

pub fn print_result(result: &CommandResult) {
    let Some(state) = &result.state else {
        return;
    };
    if result.disconnected {
        println!("warp: {} (disconnected)", state.warp);
        return;
    }
    println!("warp: {}", state.warp);
    println!(
        "window: {}x{}",
        state.window_size.rows, state.window_size.cols
    );
    println!("users:");
    for user in state.users.values() {
        let host_marker = if user.hosting { " (host)" } else { "" };
        let writer_marker = if user.mode.contains(Mode::SHELL_WRITE) && !user.hosting {
            " [writer]"
        } else {
            ""
        };
        println!("  {} {}{}{}", user.token, user.username, host_marker, writer_marker);
    }
}

pub async fn state() -> anyhow::Result<()> {
    let result = run_command(Command {
        kind: command::STATE.to_string(),
        args: vec![],
    })
    .await?;
    print_result(&result);
    Ok(())
}

pub async fn authorize(user: String) -> anyhow::Result<()> {
    let result = run_command(Command {
        kind: command::AUTHORIZE.to_string(),
        args: vec![user],
    })
    .await?;
    println!("Done.");
    print_result(&result);
    Ok(())
}

pub async fn revoke(users: Vec<String>) -> anyhow::Result<()> {
    let result = run_command(Command {
        kind: command::REVOKE.to_string(),
        args: users,
    })
    .await?;
    println!("Done.");
    print_result(&result);
    Ok(())
}
