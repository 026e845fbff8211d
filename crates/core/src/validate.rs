// SPDX-License-Identifier: MIT

//! Instruction validation and the dangerous-pattern screen.
//!
//! Validation failures never reach a worker: the queue rejects them at
//! enqueue time and publishes `instruction:rejected`.

use crate::error::InstructionError;
use crate::job::MAX_INSTRUCTION_BYTES;
use regex::RegexSet;

/// Validate an externally-supplied container identifier: either a UUID
/// (8-4-4-4-12, case-insensitive hex) or a bare 12–64 character hex string.
pub fn validate_container_id(id: &str) -> bool {
    fn is_hex(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    if (12..=64).contains(&id.len()) && is_hex(id) {
        return true;
    }

    // UUID: xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
    let parts: Vec<&str> = id.split('-').collect();
    id.len() == 36
        && parts.len() == 5
        && [8, 4, 4, 4, 12]
            .iter()
            .zip(&parts)
            .all(|(len, part)| part.len() == *len && is_hex(part))
}

/// Strip disallowed control characters (everything below 0x20 except LF
/// and TAB, plus DEL) and enforce the instruction size cap.
pub fn sanitize_instruction(raw: &str) -> Result<String, InstructionError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    if cleaned.len() > MAX_INSTRUCTION_BYTES {
        return Err(InstructionError::Oversized {
            got: cleaned.len(),
            max: MAX_INSTRUCTION_BYTES,
        });
    }
    Ok(cleaned)
}

/// Blocked patterns. Label first, regex second; the label is what
/// reaches logs and the rejection event (the raw instruction does not).
const BLOCKED: &[(&str, &str)] = &[
    ("fork bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;?\s*:"),
    ("recursive filesystem delete", r"(?i)\brm\s+(-[a-z]*\s+)*-[a-z]*[rf][a-z]*\s+(--\S+\s+)*(/|/\*|~|\$HOME)\s*($|;|&|\|)"),
    ("filesystem format", r"(?i)\bmkfs(\.\w+)?\b"),
    ("raw device write", r"(?i)\bdd\s+[^|;]*\bof=/dev/"),
    ("world-writable root", r"(?i)\bchmod\s+(-[a-z]+\s+)*777\s+/\s*($|;|&|\|)"),
    ("netcat listener", r"(?i)\b(nc|ncat|netcat)\b[^|;]*\s-[a-z]*l"),
    ("crypto miner", r"(?i)\b(xmrig|minerd|cpuminer|cgminer|bfgminer|ethminer|t-rex|nbminer)\b"),
    ("reverse shell", r"(?i)\b(bash|sh)\s+-i\s+>&\s*/dev/(tcp|udp)/"),
    ("pipe remote script to shell", r"(?i)\b(curl|wget)\b[^|;]*\|\s*(sudo\s+)?(ba)?sh\b"),
    ("git credential exfiltration", r"(?i)\bgit\s+credential(-store|-cache)?\b[^|;]*\b(fill|get)\b"),
    ("ssh key read", r"(?i)\.ssh/id_[a-z0-9_]+"),
    ("kernel module operation", r"(?i)\b(insmod|rmmod|modprobe)\b"),
    ("cron injection", r"(?i)(\bcrontab\s+(-[a-z]+\s+)*\S+|>>?\s*/etc/cron|>>?\s*/var/spool/cron)"),
    ("privileged runtime flag", r"(?i)(--privileged\b|--cap-add[=\s]+SYS_ADMIN|/var/run/docker\.sock|--pid[=\s]+host|--net(work)?[=\s]+host)"),
    ("network scanner", r"(?i)\b(nmap|masscan|zmap|arp-scan)\b"),
];

/// Advisory patterns: logged as warnings, never blocked.
const ADVISORY: &[(&str, &str)] = &[
    ("decoded pipe to shell", r"(?i)\bbase64\s+(-d|--decode)\b[^|;]*\|\s*(ba)?sh\b"),
    ("shell history tamper", r"(?i)\bhistory\s+-c\b|\bunset\s+HISTFILE\b"),
    ("recursive chown", r"(?i)\bchown\s+(-[a-z]+\s+)*-R\b"),
];

/// Outcome of screening one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Safe to enqueue; `warnings` lists matched advisory labels.
    Allowed { warnings: Vec<&'static str> },
    /// Hard reject; `pattern` is the matched blocked-pattern label.
    Blocked { pattern: &'static str },
}

/// Compiled dangerous-instruction screen.
///
/// Built once at startup and shared; both sets compile from static
/// pattern tables so construction only fails on a programming error.
pub struct InstructionScreen {
    blocked: RegexSet,
    advisory: RegexSet,
}

impl InstructionScreen {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            blocked: RegexSet::new(BLOCKED.iter().map(|(_, re)| *re))?,
            advisory: RegexSet::new(ADVISORY.iter().map(|(_, re)| *re))?,
        })
    }

    /// Screen a sanitized instruction. First blocked match wins.
    pub fn screen(&self, instruction: &str) -> Verdict {
        if let Some(idx) = self.blocked.matches(instruction).iter().next() {
            return Verdict::Blocked { pattern: BLOCKED[idx].0 };
        }
        let warnings =
            self.advisory.matches(instruction).iter().map(|idx| ADVISORY[idx].0).collect();
        Verdict::Allowed { warnings }
    }

    /// Full validation path used at enqueue: sanitize, then screen.
    pub fn check(&self, raw: &str) -> Result<String, InstructionError> {
        let cleaned = sanitize_instruction(raw)?;
        match self.screen(&cleaned) {
            Verdict::Blocked { pattern } => {
                Err(InstructionError::Dangerous(pattern.to_string()))
            }
            Verdict::Allowed { warnings } => {
                for label in warnings {
                    tracing::warn!(pattern = label, "instruction matched advisory pattern");
                }
                Ok(cleaned)
            }
        }
    }
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
