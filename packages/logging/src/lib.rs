#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub use log;

#[cfg(feature = "macros")]
mod macros;

/// Environment variable holding the log filter. Falls back to `RUST_LOG`.
pub const LOG_ENV: &str = "REAPER_LOG";

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "reaper=trace";
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "reaper=info";

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

/// The filter directives `init` applies: `REAPER_LOG`, then `RUST_LOG`, then a crate-wide
/// default (`trace` in debug builds, `info` in release builds).
#[must_use]
pub fn filter() -> String {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().filter(|x| !x.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

/// Installs `pretty_env_logger` with the directives from [`filter`].
///
/// # Errors
///
/// * If a logger was already installed
#[cfg(feature = "init")]
pub fn init() -> Result<(), InitError> {
    init_with_filter(&filter())
}

/// # Errors
///
/// * If a logger was already installed
#[cfg(feature = "init")]
pub fn init_with_filter(filter: &str) -> Result<(), InitError> {
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(filter)
        .try_init()?;

    log::trace!("init: filter={filter}");

    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let saved = vars
            .iter()
            .map(|(name, _)| (*name, std::env::var(name).ok()))
            .collect::<Vec<_>>();
        let apply = |vars: &[(&str, Option<&str>)]| {
            for (name, value) in vars {
                // SAFETY: tests touching the environment are serialized
                unsafe {
                    match value {
                        Some(value) => std::env::set_var(name, value),
                        None => std::env::remove_var(name),
                    }
                }
            }
        };

        apply(vars);
        f();
        apply(
            &saved
                .iter()
                .map(|(name, value)| (*name, value.as_deref()))
                .collect::<Vec<_>>(),
        );
    }

    #[test]
    #[serial]
    fn filter_prefers_reaper_log() {
        with_env(
            &[(LOG_ENV, Some("reaper_child=debug")), ("RUST_LOG", Some("warn"))],
            || assert_eq!(filter(), "reaper_child=debug"),
        );
    }

    #[test]
    #[serial]
    fn filter_falls_back_to_rust_log_then_default() {
        with_env(&[(LOG_ENV, Some("  ")), ("RUST_LOG", Some("warn"))], || {
            assert_eq!(filter(), "warn");
        });
        with_env(&[(LOG_ENV, None), ("RUST_LOG", None)], || {
            assert_eq!(filter(), DEFAULT_LOG_LEVEL);
        });
    }

    #[cfg(feature = "init")]
    #[test]
    #[serial]
    fn second_init_is_an_error() {
        // whichever call comes first may install the logger, the next must fail
        let _ = init_with_filter("off");
        assert!(matches!(
            init_with_filter("off"),
            Err(InitError::SetLogger(_))
        ));
    }
}
