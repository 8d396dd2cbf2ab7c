//! Host eligibility for probe definitions.

use crate::Result;
use regex::Regex;

/// Whether a probe with the given `run_on` pattern should run on `hostname`.
///
/// An absent or empty pattern matches every host. The pattern is an
/// unanchored regex, so `web` matches `web-1` as well as `prod-web-1`.
pub fn run_on_this_host(run_on: Option<&str>, hostname: &str) -> Result<bool> {
    let pattern = match run_on {
        None | Some("") => return Ok(true),
        Some(pattern) => pattern,
    };
    let re = Regex::new(pattern)?;
    Ok(re.is_match(hostname))
}
