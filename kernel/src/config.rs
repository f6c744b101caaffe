// SPDX-License-Identifier: MPL-2.0

//! Limits and policies of the IPC subsystem.
//!
//! The defaults follow the default values in Linux. They can be overridden on the kernel
//! command line with module arguments of the `sysvipc` module, e.g.,
//!
//! ```text
//! sysvipc.semmsl=250 sysvipc.msgmnb=32768 sysvipc.avoidance=bypass
//! ```
//!
//! The format conforms to the Linux kernel command line rules:
//!
//! <https://www.kernel.org/doc/html/v6.4/admin-guide/kernel-parameters.html>

use core::str::FromStr;

use crate::prelude::*;

/// The module name of the IPC options on the kernel command line.
pub const CMDLINE_MODULE: &str = "sysvipc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemLimits {
    /// Maximum number of semaphores per semaphore set.
    pub semmsl: usize,
    /// Maximum number of semaphore sets.
    pub semmni: usize,
    /// Maximum number of operations for semop.
    pub semopm: usize,
    /// Maximum semaphore value.
    pub semvmx: i32,
    /// Maximum value that can be recorded for semaphore adjustment (SEM_UNDO).
    pub semaem: i32,
}

impl Default for SemLimits {
    fn default() -> Self {
        Self {
            semmsl: 32000,
            semmni: 32000,
            semopm: 500,
            semvmx: 32767,
            semaem: 32767,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgLimits {
    /// Maximum size of a message in bytes.
    pub msgmax: usize,
    /// Default maximum size of a queue in bytes.
    pub msgmnb: usize,
    /// Maximum number of message queues.
    pub msgmni: usize,
}

impl Default for MsgLimits {
    fn default() -> Self {
        Self {
            msgmax: 8192,
            msgmnb: 16384,
            msgmni: 32000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLimits {
    /// Minimum size of a segment in bytes.
    pub shmmin: usize,
    /// Maximum size of a segment in bytes.
    pub shmmax: usize,
    /// Maximum number of pages of all segments.
    pub shmall: usize,
    /// Maximum number of segments.
    pub shmmni: usize,
}

impl Default for ShmLimits {
    fn default() -> Self {
        Self {
            shmmin: 1,
            shmmax: usize::MAX - (1 << 24),
            shmall: usize::MAX - (1 << 24),
            shmmni: 4096,
        }
    }
}

/// Whether semaphore decrements go through the deadlock-avoidance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvoidancePolicy {
    /// Every decrement is admitted only if the resulting state is safe.
    #[default]
    Enforce,
    /// Classic System V semantics. Decrements only wait for the values.
    Bypass,
}

impl FromStr for AvoidancePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enforce" => Ok(Self::Enforce),
            "bypass" => Ok(Self::Bypass),
            _ => Err(Error::with_message(
                Errno::EINVAL,
                "unknown deadlock avoidance policy",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcConfig {
    pub sem: SemLimits,
    pub msg: MsgLimits,
    pub shm: ShmLimits,
    pub avoidance: AvoidancePolicy,
}

impl IpcConfig {
    /// Builds a configuration from the kernel command line.
    ///
    /// Only the `sysvipc.option=value` arguments are considered. Unknown options and
    /// malformed values are reported and skipped.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();

        for arg in cmdline.split_whitespace() {
            if arg == "--" {
                // Everything after it belongs to the init process.
                break;
            }
            let Some((entry, value)) = arg.split_once('=') else {
                continue;
            };
            let Some((module, option)) = entry.split_once('.') else {
                continue;
            };
            if module != CMDLINE_MODULE {
                continue;
            }
            if let Err(err) = config.set_option(option, value) {
                warn!(
                    "[IpcConfig] Unable to apply kernel argument {}: {}, skip for now",
                    arg, err
                );
            }
        }

        config
    }

    fn set_option(&mut self, option: &str, value: &str) -> Result<()> {
        match option {
            "semmsl" => self.sem.semmsl = parse_limit(value)?,
            "semmni" => self.sem.semmni = parse_limit(value)?,
            "semopm" => self.sem.semopm = parse_limit(value)?,
            "semvmx" => {
                let semvmx: i32 = parse_limit(value)?;
                // `GETALL` and `SETALL` carry the values as `unsigned short`.
                if !(0..=u16::MAX as i32).contains(&semvmx) {
                    return_errno_with_message!(Errno::EINVAL, "semvmx is out of range");
                }
                self.sem.semvmx = semvmx;
            }
            "semaem" => self.sem.semaem = parse_limit(value)?,
            "msgmax" => self.msg.msgmax = parse_limit(value)?,
            "msgmnb" => self.msg.msgmnb = parse_limit(value)?,
            "msgmni" => self.msg.msgmni = parse_limit(value)?,
            "shmmin" => self.shm.shmmin = parse_limit(value)?,
            "shmmax" => self.shm.shmmax = parse_limit(value)?,
            "shmall" => self.shm.shmall = parse_limit(value)?,
            "shmmni" => self.shm.shmmni = parse_limit(value)?,
            "avoidance" => self.avoidance = value.parse()?,
            _ => return_errno_with_message!(Errno::EINVAL, "unknown option"),
        }
        Ok(())
    }
}

fn parse_limit<T: FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::with_message(Errno::EINVAL, "malformed number"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_linux() {
        let config = IpcConfig::default();
        assert_eq!(config.sem.semmsl, 32000);
        assert_eq!(config.sem.semopm, 500);
        assert_eq!(config.sem.semvmx, 32767);
        assert_eq!(config.msg.msgmax, 8192);
        assert_eq!(config.msg.msgmnb, 16384);
        assert_eq!(config.shm.shmmni, 4096);
        assert_eq!(config.avoidance, AvoidancePolicy::Enforce);
    }

    #[test]
    fn parse_module_args() {
        let config = IpcConfig::from_cmdline(
            "init=/bin/sh sysvipc.semmsl=250 console=ttyS0 sysvipc.avoidance=bypass \
             sysvipc.msgmnb=64 -- sysvipc.semopm=1",
        );
        assert_eq!(config.sem.semmsl, 250);
        assert_eq!(config.msg.msgmnb, 64);
        assert_eq!(config.avoidance, AvoidancePolicy::Bypass);
        // Arguments of the init process are not kernel options.
        assert_eq!(config.sem.semopm, 500);
    }

    #[test]
    fn malformed_args_are_skipped() {
        let config = IpcConfig::from_cmdline(
            "sysvipc.semmsl=lots sysvipc.unknown=1 sysvipc.avoidance=maybe sysvipc.semmni",
        );
        assert_eq!(config, IpcConfig::default());
    }

    #[test]
    fn semvmx_fits_in_u16() {
        let config = IpcConfig::from_cmdline("sysvipc.semvmx=65535");
        assert_eq!(config.sem.semvmx, 65535);

        let config = IpcConfig::from_cmdline("sysvipc.semvmx=65536 sysvipc.semvmx=-1");
        assert_eq!(config.sem.semvmx, 32767);
    }
}
