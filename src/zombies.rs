// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zombie-process janitor.
//!
//! The container occasionally hosts short-lived helper subprocesses (key
//! staging, debug tooling). This task scans the process table for zombies
//! and reaps them with a non-blocking wait. It is independent of the
//! reconciler; all errors are logged and ignored.

use crate::background::BackgroundTask;
use futures::future::BoxFuture;
use futures::FutureExt;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use slog::{debug, info, warn, Logger};
use slog_error_chain::InlineErrorChain;

pub struct ZombieReaper {
    log: Logger,
}

impl ZombieReaper {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl BackgroundTask for ZombieReaper {
    fn activate(&mut self) -> BoxFuture<'_, ()> {
        async {
            for pid in find_zombies(&self.log) {
                reap_zombie(pid, &self.log);
            }
        }
        .boxed()
    }
}

/// Extract the process state character from a `/proc/<pid>/stat` line.
/// The state is the field following the parenthesized command name, which
/// may itself contain spaces and parentheses.
fn parse_stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

fn find_zombies(log: &Logger) -> Vec<i32> {
    let mut zombies = Vec::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                log, "error reading process table";
                InlineErrorChain::new(&err),
            );
            return zombies;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) =
            std::fs::read_to_string(entry.path().join("stat"))
        else {
            // process exited between readdir and here
            continue;
        };
        if parse_stat_state(&stat) == Some('Z') {
            info!(log, "found a zombie process"; "pid" => pid);
            zombies.push(pid);
        }
    }
    zombies
}

/// Reap the zombie with a non-blocking wait; it only collects an exit
/// status that is already available.
fn reap_zombie(pid: i32, log: &Logger) {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => {
            debug!(
                log, "cleaned up zombie process";
                "pid" => pid,
                "status" => ?status,
            );
        }
        Err(err) => {
            warn!(
                log, "error waiting for zombie process";
                "pid" => pid,
                "err" => %err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_state_parsing() {
        assert_eq!(
            parse_stat_state("1234 (conman) Z 1 1234 1234 0 -1 4194560"),
            Some('Z'),
        );
        assert_eq!(
            parse_stat_state("1 (systemd) S 0 1 1 0 -1 4194560"),
            Some('S'),
        );
        // command names may contain spaces and parens
        assert_eq!(
            parse_stat_state("77 (tail -F (log)) Z 1 77 77 0 -1 0"),
            Some('Z'),
        );
        assert_eq!(parse_stat_state("bogus"), None);
        assert_eq!(parse_stat_state(""), None);
    }
}
