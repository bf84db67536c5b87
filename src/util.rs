use crate::{Error, Result};

use std::path::{Component, Path};

pub(crate) fn canonicalize_unit_name(input: &str) -> Result<String> {
    validate_no_control("service", input)?;
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::invalid_input("service must not be empty"));
    }
    if input.starts_with('-') {
        return Err(Error::invalid_input("service must not start with '-'"));
    }
    if input.contains('/') || input.contains('\\') {
        return Err(Error::invalid_input(
            "service must not contain path separators",
        ));
    }
    if input.contains("..") {
        return Err(Error::invalid_input("service must not contain '..'"));
    }

    if input.contains('.') {
        return Ok(input.to_string());
    }
    Ok(format!("{input}.service"))
}

/// Validate a positional operand (package name, repository id, URL) so it cannot be read as an
/// option by the privileged command.
pub(crate) fn validate_operand(context: &'static str, input: &str) -> Result<()> {
    validate_no_control(context, input)?;
    if input.trim().is_empty() {
        return Err(Error::invalid_input(format!("{context} must not be empty")));
    }
    if input.starts_with('-') {
        return Err(Error::invalid_input(format!(
            "{context} must not start with '-'"
        )));
    }
    Ok(())
}

pub(crate) fn validate_program(context: &'static str, input: &str) -> Result<()> {
    validate_no_control(context, input)?;
    if input.trim().is_empty() {
        return Err(Error::invalid_input(format!("{context} must not be empty")));
    }
    if input.starts_with('-') {
        return Err(Error::invalid_input(format!(
            "{context} must not start with '-'"
        )));
    }
    Ok(())
}

pub(crate) fn validate_arg(input: &str) -> Result<()> {
    if input.contains('\0') {
        return Err(Error::invalid_input("argument must not contain NUL"));
    }
    Ok(())
}

pub(crate) fn validate_system_path(input: &str) -> Result<()> {
    validate_no_control("path", input)?;
    let path = Path::new(input);
    if !path.is_absolute() {
        return Err(Error::invalid_input("path must be absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::invalid_input("path must not contain '..'"));
    }
    if path.parent().is_none() {
        return Err(Error::invalid_input("path must not be the filesystem root"));
    }
    Ok(())
}

pub(crate) fn validate_no_control(context: &'static str, input: &str) -> Result<()> {
    if input.contains('\0') {
        return Err(Error::invalid_input(format!(
            "{context} must not contain NUL"
        )));
    }
    if input.contains('\n') || input.contains('\r') {
        return Err(Error::invalid_input(format!(
            "{context} must not contain newlines"
        )));
    }
    if input.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_input(format!(
            "{context} must not contain control characters"
        )));
    }
    Ok(())
}

pub(crate) fn push_limited(out: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let remaining = cap.saturating_sub(out.len());
    let n = std::cmp::min(chunk.len(), remaining);
    out.extend_from_slice(&chunk[..n]);
    n < chunk.len()
}

/// Lossy UTF-8 decoding that keeps an incomplete trailing sequence for the next chunk.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can be an unfinished prefix.
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            return 0;
        };
        let have = bytes.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
