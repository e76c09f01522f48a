//! Terminal-command actions are spawned through the platform shell and
//! not waited for; a failure to spawn is logged and otherwise ignored.

use std::process::Command;

pub fn execute_terminal_command(command: &str) -> bool {
    let result = if cfg!(target_os = "windows") {
        Command::new("cmd").args(["/C", command]).spawn()
    } else {
        Command::new("sh").args(["-c", command]).spawn()
    };
    match result {
        Ok(_) => true,
        Err(error) => {
            log::error!("executing terminal command '{command}' failed: {error}");
            false
        }
    }
}
