//! Reference launchpad client.
//!
//! Connects out to a launchpad server and exposes a small set of methods the
//! server can call back:
//!
//! - `fs.enumerate_directory(dir_path)` lists a directory with stat records
//! - `shell.run_shell_command(shell_command, current_dir)` runs a command and
//!   returns its combined output
//! - `client.ping()` answers `"pong"`
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod fs;
pub mod shell;

use std::time::Duration;

use launchpad_rpc::{MethodTable, RetryPolicy, Value};

/// Client error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No connector handles the scheme of the address
    #[error("no connect transport available for protocol {0}")]
    NoTransport(String),

    /// Malformed `--reconnect` arguments
    #[error("invalid reconnect policy: {0}")]
    ReconnectPolicy(String),
}

/// Every method the client exposes to the server.
#[must_use]
pub fn methods() -> MethodTable {
    let mut methods = MethodTable::new();
    methods
        .mount("fs", fs::methods())
        .mount("shell", shell::methods())
        .register("client.ping", |_session, _params| async {
            Ok(Value::Text("pong".to_string()))
        });
    methods
}

/// Build the retry policy from flattened `TRIES SECONDS` pairs.
///
/// No pairs at all selects the default policy.
///
/// # Errors
///
/// Returns [`Error::ReconnectPolicy`] when a value is missing or `TRIES` does
/// not fit in 32 bits.
pub fn retry_policy(reconnect: &[u64], reconnect_default: Option<u64>) -> Result<RetryPolicy, Error> {
    let default_sleep = reconnect_default.map(Duration::from_secs);

    if reconnect.is_empty() {
        let policy = RetryPolicy::default();
        return Ok(RetryPolicy::new(policy.steps().iter().copied(), default_sleep));
    }

    if reconnect.len() % 2 != 0 {
        return Err(Error::ReconnectPolicy(
            "expected TRIES SECONDS pairs".to_string(),
        ));
    }

    let steps = reconnect
        .chunks_exact(2)
        .map(|pair| {
            let tries = u32::try_from(pair[0])
                .map_err(|_| Error::ReconnectPolicy(format!("too many tries: {}", pair[0])))?;
            Ok((tries, Duration::from_secs(pair[1])))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(RetryPolicy::new(steps, default_sleep))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(
            methods().names(),
            vec![
                "client.ping",
                "fs.enumerate_directory",
                "shell.run_shell_command"
            ]
        );
    }

    #[test]
    fn test_default_policy() {
        let policy = retry_policy(&[], None).unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let policy = retry_policy(&[], Some(10)).unwrap();
        assert_eq!(policy.sleep_for(6), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_pairs_in_any_order() {
        let policy = retry_policy(&[6, 3, 3, 1], None).unwrap();
        assert_eq!(policy.sleep_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.sleep_for(4), Some(Duration::from_secs(3)));
        assert_eq!(policy.sleep_for(6), None);
    }

    #[test]
    fn test_rejects_bad_pairs() {
        assert!(matches!(
            retry_policy(&[3], None),
            Err(Error::ReconnectPolicy(_))
        ));
        assert!(matches!(
            retry_policy(&[u64::MAX, 1], None),
            Err(Error::ReconnectPolicy(_))
        ));
    }
}
