//! Fallback debug shell.
//!
//! Inside the initramfs there is nowhere sensible to exit to, so on
//! any install failure we hand the console to an operator instead of
//! rebooting into a half-written disk.

use std::process::Command;

pub fn debug_shell() -> ! {
    eprintln!("dropping to debug shell; exit to respawn");
    loop {
        match Command::new("/bin/sh").status() {
            Ok(status) => eprintln!("shell exited ({status}); respawning"),
            Err(e) => {
                eprintln!("cannot spawn /bin/sh: {e}");
                std::thread::sleep(std::time::Duration::from_secs(5));
            }
        }
    }
}
